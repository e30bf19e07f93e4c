//! Core data model: resource envelopes and reindex jobs.

mod job;
mod resource;

pub use job::{
    Continuation, ReindexJobParams, ReindexJobRecord, ReindexJobStatus, ResourceCount,
};
pub use resource::{embed_meta, truncate_to_micros, Record, RequestMethod, ResourceKey};
