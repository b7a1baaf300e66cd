//! Postgres-row-backed [`RecipeLookup`] (spec §3 "Recipe (external)").
//!
//! `RecipeLookup::get`/`find_for_intent` are synchronous — the recipe
//! catalog is a small, slow-changing table, so rather than thread async
//! Postgres calls through a sync trait, this loads the whole table into an
//! in-memory cache once at startup and on explicit [`PostgresRecipeLookup::refresh`]
//! calls, the same shape as `octolab_domain::InMemoryRecipeCatalog` but
//! sourced from a table instead of a literal `Vec`.

use std::collections::HashMap;
use std::sync::RwLock;

use octolab_domain::{LabIntent, Recipe, RecipeId, RecipeLookup};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;

const RECIPES_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS recipes (
    id                 UUID PRIMARY KEY,
    name               TEXT NOT NULL,
    software           TEXT NOT NULL,
    version_constraint TEXT,
    exploit_family     TEXT,
    is_active          BOOLEAN NOT NULL DEFAULT TRUE
);
"#;

pub struct PostgresRecipeLookup {
    pool: PgPool,
    cache: RwLock<HashMap<RecipeId, Recipe>>,
}

impl PostgresRecipeLookup {
    /// Runs the `recipes` table migration, loads every row into the cache,
    /// and returns the lookup ready to serve `get`/`find_for_intent`.
    pub async fn load(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query(RECIPES_MIGRATION)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Internal(format!("recipes migration: {e}")))?;
        let lookup = Self { pool, cache: RwLock::new(HashMap::new()) };
        lookup.refresh().await?;
        Ok(lookup)
    }

    /// Re-reads the full `recipes` table into the cache. Safe to call
    /// periodically from an operator-triggered refresh — there is no
    /// background poller here since the catalog is explicitly out of
    /// scope for this subsystem (spec §1).
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, software, version_constraint, exploit_family, is_active FROM recipes",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(format!("loading recipes: {e}")))?;

        let mut next = HashMap::with_capacity(rows.len());
        for row in rows {
            let id = RecipeId(row.try_get::<Uuid, _>("id").map_err(|e| StoreError::Internal(e.to_string()))?);
            let recipe = Recipe {
                id,
                name: row.try_get("name").map_err(|e| StoreError::Internal(e.to_string()))?,
                software: row.try_get("software").map_err(|e| StoreError::Internal(e.to_string()))?,
                version_constraint: row
                    .try_get("version_constraint")
                    .map_err(|e| StoreError::Internal(e.to_string()))?,
                exploit_family: row.try_get("exploit_family").map_err(|e| StoreError::Internal(e.to_string()))?,
                is_active: row.try_get("is_active").map_err(|e| StoreError::Internal(e.to_string()))?,
            };
            next.insert(id, recipe);
        }

        *self.cache.write().expect("recipe cache lock poisoned") = next;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("recipe cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecipeLookup for PostgresRecipeLookup {
    fn get(&self, id: RecipeId) -> Option<Recipe> {
        self.cache.read().expect("recipe cache lock poisoned").get(&id).cloned()
    }

    fn find_for_intent(&self, intent: &LabIntent) -> Option<Recipe> {
        self.cache
            .read()
            .expect("recipe cache lock poisoned")
            .values()
            .find(|r| {
                r.is_active
                    && intent.software.as_ref().map_or(true, |s| &r.software == s)
                    && intent.version.as_ref().map_or(true, |v| r.version_constraint.as_ref() == Some(v))
                    && intent.exploit_family.as_ref().map_or(true, |f| r.exploit_family.as_ref() == Some(f))
            })
            .cloned()
    }
}
