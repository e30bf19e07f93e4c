//! Storage backends: contract traits plus PostgreSQL and in-memory
//! implementations.

mod memory;
mod memory_jobs;
mod postgres;
mod postgres_jobs;
pub mod traits;

pub use memory::MemoryResourceStore;
pub use memory_jobs::MemoryJobStore;
pub use postgres::PostgresResourceStore;
pub use postgres_jobs::PostgresJobStore;
pub use traits::{
    IndexWriter, JobStore, ResourceStore, StoreBackend, UpsertKind, UpsertOptions, UpsertOutcome,
};
