pub mod error;
pub mod naming;
pub mod recipe;
pub mod types;

pub use error::DomainError;
pub use recipe::{InMemoryRecipeCatalog, LabIntent, Recipe, RecipeLookup};
pub use types::{EvidenceSealStatus, EvidenceState, Lab, LabId, LabStatus, OwnerId, RecipeId, Runtime};
