//! Versioned resource storage engine for a FHIR-style healthcare-record
//! server.
//!
//! Two tightly-coupled subsystems make up the crate:
//!
//! * **Resource store** ([`db`]): a versioned, optimistically concurrent
//!   key-value layer addressed by `(type, logical id, version)`, with
//!   history, soft/hard delete, and a secondary search index that can be
//!   re-materialized independently of the primary record.
//! * **Reindex coordinator** ([`reindex`]): a durable background job
//!   manager that replays newly-supported extraction rules over persisted
//!   resources, rebuilding their search indexes in place without bumping
//!   resource versions, and promotes the rules to searchable once completion
//!   is proven.
//!
//! The HTTP surface, authorization, and the clinical path language live
//! outside this crate; the seams are the traits in [`db::traits`] and
//! [`search`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod reindex;
pub mod search;

pub use error::{Error, ErrorKind, Result};
