//! Progress events, the only cross-layer observation channel the core owes
//! its clients. Delivery is at-least-once; consumers must tolerate duplicate
//! `complete` events.

use std::sync::Arc;

/// One progress notification from the recipe executor or cleaning controller.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// Short label of the current step, e.g. `pour Gin`.
    pub step: String,
    /// Overall progress in `[0, 100]`.
    pub percent: f32,
    /// Optional free-form detail for display.
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(step: impl Into<String>, percent: f32) -> Self {
        Self {
            step: step.into(),
            percent,
            message: None,
        }
    }

    pub fn with_message(step: impl Into<String>, percent: f32, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            percent,
            message: Some(message.into()),
        }
    }
}

/// Callback invoked for every [`ProgressEvent`].
pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
