use serde::{Deserialize, Serialize};

use crate::types::RecipeId;

/// Immutable description of a lab template. The orchestrator reads recipes;
/// it never writes them — the recipe catalog is an external collaborator
/// (spec §1, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,
    pub name: String,
    pub software: String,
    pub version_constraint: Option<String>,
    pub exploit_family: Option<String>,
    pub is_active: bool,
}

/// What a caller provides when requesting a lab: either an exact recipe id,
/// or an intent the catalog resolves to one. Mirrors `LabCreate`/`LabIntent`
/// in the original source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabIntent {
    pub software: Option<String>,
    pub version: Option<String>,
    pub exploit_family: Option<String>,
}

/// Read-only seam onto the recipe catalog. Kept as a trait so this crate
/// (and the orchestrator) never depends on a concrete storage engine for
/// recipes — the catalog itself is out of scope (spec §1).
pub trait RecipeLookup: Send + Sync {
    fn get(&self, id: RecipeId) -> Option<Recipe>;
    fn find_for_intent(&self, intent: &LabIntent) -> Option<Recipe>;
}

/// Matches `_select_recipe_for_intent`: only `is_active` recipes are
/// eligible, and each intent field present narrows the candidate set by
/// exact equality. An intent with every field `None` matches any active
/// recipe, picking the first one found — there is no further tie-break in
/// the source to preserve.
fn matches_intent(recipe: &Recipe, intent: &LabIntent) -> bool {
    if !recipe.is_active {
        return false;
    }
    if let Some(software) = &intent.software {
        if &recipe.software != software {
            return false;
        }
    }
    if let Some(version) = &intent.version {
        if recipe.version_constraint.as_ref() != Some(version) {
            return false;
        }
    }
    if let Some(family) = &intent.exploit_family {
        if recipe.exploit_family.as_ref() != Some(family) {
            return false;
        }
    }
    true
}

/// A simple, process-local recipe catalog: a flat `Vec<Recipe>` behind a
/// lock, loaded once at startup. Provided for completeness (spec §3
/// "Recipe (external)") — the catalog itself is out of scope, but
/// something has to implement [`RecipeLookup`] for the CLI's `serve`
/// command to run against.
#[derive(Default)]
pub struct InMemoryRecipeCatalog {
    recipes: std::sync::RwLock<Vec<Recipe>>,
}

impl InMemoryRecipeCatalog {
    pub fn new(recipes: Vec<Recipe>) -> Self {
        Self { recipes: std::sync::RwLock::new(recipes) }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn replace(&self, recipes: Vec<Recipe>) {
        *self.recipes.write().expect("recipe catalog lock poisoned") = recipes;
    }
}

impl RecipeLookup for InMemoryRecipeCatalog {
    fn get(&self, id: RecipeId) -> Option<Recipe> {
        self.recipes.read().expect("recipe catalog lock poisoned").iter().find(|r| r.id == id).cloned()
    }

    fn find_for_intent(&self, intent: &LabIntent) -> Option<Recipe> {
        self.recipes
            .read()
            .expect("recipe catalog lock poisoned")
            .iter()
            .find(|r| matches_intent(r, intent))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecipeId;
    use uuid::Uuid;

    fn recipe(software: &str, active: bool) -> Recipe {
        Recipe {
            id: RecipeId(Uuid::new_v4()),
            name: software.to_string(),
            software: software.to_string(),
            version_constraint: Some("1.0".to_string()),
            exploit_family: Some("rce".to_string()),
            is_active: active,
        }
    }

    #[test]
    fn inactive_recipes_are_never_matched() {
        let r = recipe("apache", false);
        let catalog = InMemoryRecipeCatalog::new(vec![r]);
        let intent = LabIntent { software: Some("apache".to_string()), ..Default::default() };
        assert!(catalog.find_for_intent(&intent).is_none());
    }

    #[test]
    fn intent_fields_narrow_by_exact_match() {
        let r = recipe("apache", true);
        let catalog = InMemoryRecipeCatalog::new(vec![r.clone()]);
        let matching = LabIntent { software: Some("apache".to_string()), ..Default::default() };
        assert_eq!(catalog.find_for_intent(&matching).unwrap().id, r.id);

        let wrong_version = LabIntent {
            software: Some("apache".to_string()),
            version: Some("2.0".to_string()),
            ..Default::default()
        };
        assert!(catalog.find_for_intent(&wrong_version).is_none());
    }

    #[test]
    fn get_looks_up_by_id_regardless_of_active_flag() {
        let r = recipe("nginx", false);
        let catalog = InMemoryRecipeCatalog::new(vec![r.clone()]);
        assert_eq!(catalog.get(r.id).unwrap().id, r.id);
    }
}
