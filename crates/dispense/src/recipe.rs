//! Drink recipes: the minimal record the executor consumes, plus the
//! persisted recipe book.

use std::ops::RangeInclusive;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::topology::atomic_write_json;

/// Accepted range of the per-recipe dose scalar (1.0 = single, 2.0 = double).
pub const DOSE_RANGE: RangeInclusive<f64> = 0.5..=3.0;

/// Classification of an ingredient, controlling dispense order.
///
/// The variant order *is* the pour order: heavier, more viscous spirits
/// first; carbonated mixers last to preserve fizz; garnishes are never
/// dispensed. Unknown categories in a recipe document are rejected at parse
/// time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PourCategory {
    Spirits,
    Syrup,
    Juice,
    Mixer,
    Garnish,
}

/// One line of a recipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecipeIngredient {
    pub name: String,
    pub amount_ml: f64,
    pub category: PourCategory,
}

/// A drink recipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(default)]
    pub glass: String,
    #[serde(default)]
    pub garnish: String,
    #[serde(default)]
    pub instructions: Vec<String>,
}

impl Recipe {
    /// Ingredients in dispense order: sorted by category, input order
    /// preserved within a category.
    pub fn sorted_pours(&self) -> Vec<&RecipeIngredient> {
        let mut pours: Vec<&RecipeIngredient> = self.ingredients.iter().collect();
        pours.sort_by_key(|p| p.category);
        pours
    }

    /// Total dispensed volume at dose 1.0 (garnishes excluded).
    pub fn total_volume_ml(&self) -> f64 {
        self.ingredients
            .iter()
            .filter(|i| i.category != PourCategory::Garnish)
            .map(|i| i.amount_ml)
            .sum()
    }
}

/// The persisted set of recipes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeBook {
    pub recipes: Vec<Recipe>,
}

impl RecipeBook {
    pub fn get(&self, id: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.id == id)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        atomic_write_json(path, self)
    }

    /// The built-in classics, written out on first run so the machine is
    /// usable before anyone edits a recipe file.
    pub fn default_book() -> Self {
        let ing = |name: &str, amount_ml: f64, category| RecipeIngredient {
            name: name.to_owned(),
            amount_ml,
            category,
        };
        Self {
            recipes: vec![
                Recipe {
                    id: "old_fashioned".into(),
                    name: "Old Fashioned".into(),
                    ingredients: vec![
                        ing("Bourbon", 60.0, PourCategory::Spirits),
                        ing("Simple syrup", 5.0, PourCategory::Syrup),
                        ing("Orange twist", 1.0, PourCategory::Garnish),
                    ],
                    glass: "rocks".into(),
                    garnish: "Orange twist".into(),
                    instructions: vec!["Stir gently over a large ice cube".into()],
                },
                Recipe {
                    id: "gin_fizz".into(),
                    name: "Gin Fizz".into(),
                    ingredients: vec![
                        ing("Gin", 45.0, PourCategory::Spirits),
                        ing("Lemon juice", 20.0, PourCategory::Juice),
                        ing("Simple syrup", 10.0, PourCategory::Syrup),
                        ing("Soda water", 50.0, PourCategory::Mixer),
                    ],
                    glass: "highball".into(),
                    garnish: "Lemon wheel".into(),
                    instructions: vec!["Top with soda last to keep the fizz".into()],
                },
                Recipe {
                    id: "whiskey_sour".into(),
                    name: "Whiskey Sour".into(),
                    ingredients: vec![
                        ing("Bourbon", 60.0, PourCategory::Spirits),
                        ing("Lemon juice", 25.0, PourCategory::Juice),
                        ing("Simple syrup", 15.0, PourCategory::Syrup),
                    ],
                    glass: "rocks".into(),
                    garnish: "Cherry and orange slice".into(),
                    instructions: vec!["Serve over ice".into()],
                },
                Recipe {
                    id: "manhattan".into(),
                    name: "Manhattan".into(),
                    ingredients: vec![
                        ing("Bourbon", 60.0, PourCategory::Spirits),
                        ing("Sweet vermouth", 20.0, PourCategory::Spirits),
                    ],
                    glass: "coupe".into(),
                    garnish: "Cherry".into(),
                    instructions: vec!["Stir, do not shake".into()],
                },
                Recipe {
                    id: "bees_knees".into(),
                    name: "Bee's Knees".into(),
                    ingredients: vec![
                        ing("Gin", 60.0, PourCategory::Spirits),
                        ing("Lemon juice", 20.0, PourCategory::Juice),
                        ing("Honey syrup", 15.0, PourCategory::Syrup),
                    ],
                    glass: "coupe".into(),
                    garnish: "Lemon twist".into(),
                    instructions: vec!["Shake with ice and strain".into()],
                },
            ],
        }
    }
}
