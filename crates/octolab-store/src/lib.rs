pub mod error;
pub mod memory;
pub mod postgres_store;
pub mod recipes;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryLabStore;
pub use postgres_store::PostgresLabStore;
pub use recipes::PostgresRecipeLookup;
pub use store::LabStore;
