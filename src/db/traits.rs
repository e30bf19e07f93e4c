//! Contract traits for storage backends.
//!
//! Two backends implement these: PostgreSQL (`db::postgres*`) and in-memory
//! (`db::memory*`). Backend-specific error codes never cross this boundary;
//! everything surfaces as `crate::Error` kinds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Record, ReindexJobParams, ReindexJobRecord, ResourceKey};
use crate::Result;

/// Caller policy for one upsert.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOptions {
    /// Expected current version; `None` means unconditional.
    pub if_match: Option<i32>,
    /// Whether a missing resource may be created by this call.
    pub allow_create: bool,
    /// Whether the superseded version is retained as history or purged.
    pub keep_history: bool,
}

impl UpsertOptions {
    pub fn new() -> Self {
        Self {
            if_match: None,
            allow_create: true,
            keep_history: true,
        }
    }

    pub fn if_match(mut self, version: i32) -> Self {
        self.if_match = Some(version);
        self
    }

    pub fn allow_create(mut self, allow: bool) -> Self {
        self.allow_create = allow;
        self
    }

    pub fn keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
}

/// Result of a successful upsert. `key.version_id` is `None` for the
/// deleted-over-deleted no-op.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub kind: UpsertKind,
    pub key: ResourceKey,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Versioned resource store: CRUD with optimistic concurrency, history
/// retention, and soft/hard delete.
///
/// Writes are linearizable per `(type, logical_id)` through the backend's
/// conditional-write primitive; no application-level lock is held per record.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create or update a resource.
    ///
    /// Decision table:
    /// * no current row + `if_match` present -> `ResourceNotFound`
    /// * no current row + `allow_create == false` -> `MethodNotAllowed`
    /// * no current row otherwise -> insert at version 1, `Created`
    /// * current row + `if_match` mismatch -> `VersionConflict`
    /// * current tombstone + incoming tombstone -> no-op, null-version key
    /// * current row otherwise -> new version = current + 1, `Updated`;
    ///   superseded row kept as history or purged per `keep_history`
    ///
    /// Index rows and `search_param_hash` of the incoming record replace the
    /// previous current version's rows.
    async fn upsert(&self, incoming: Record, options: UpsertOptions) -> Result<UpsertOutcome>;

    /// Read a resource.
    ///
    /// * versioned key -> exactly that row, `VersionNotFound` when absent
    ///   (even if another version is current)
    /// * unversioned key -> current row; `ResourceDeleted` for a tombstone,
    ///   `ResourceNotFound` when the key never existed or was hard-deleted
    ///
    /// When the stored payload lacks embedded meta and parses as JSON, the
    /// returned bytes carry `meta.versionId`/`meta.lastUpdated` patched in.
    async fn get(&self, key: &ResourceKey) -> Result<Record>;

    /// Delete a resource.
    ///
    /// Soft delete appends a tombstone version and returns it; deleting a
    /// missing or already-deleted resource returns `None` idempotently. Hard
    /// delete removes the current row, all history, and all index rows, and
    /// returns `None`. A versioned key is `MethodNotAllowed`.
    async fn delete(&self, key: &ResourceKey, hard: bool) -> Result<Option<i32>>;

    /// All versions of a resource, newest first. Empty when the key is
    /// unknown.
    async fn history(&self, resource_type: &str, id: &str) -> Result<Vec<Record>>;

    /// Distinct resource types with at least one current row.
    async fn list_types(&self) -> Result<Vec<String>>;

    /// Number of current, non-deleted resources of a type.
    async fn count_current(&self, resource_type: &str) -> Result<i64>;

    /// Keyset page of current, non-deleted resources ordered by logical id.
    async fn page_current(
        &self,
        resource_type: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>>;
}

/// Reindex write path: replaces the index rows of an existing current record
/// in place.
///
/// Never creates a version, never bumps `last_updated`, never touches the
/// payload. Reindex uses only this trait; it never goes through
/// [`ResourceStore::upsert`].
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Replace `search_param_hash` and index rows of the current version.
    ///
    /// Fails `VersionConflict` when `if_match` is not the current version and
    /// `ResourceNotFound` when the record is missing or not current.
    async fn update_index(&self, record: &Record, if_match: i32) -> Result<()>;

    /// Batch form of [`update_index`](Self::update_index) with atomic batch
    /// precondition: any mismatch or missing record fails the whole batch.
    async fn update_indices_batch(&self, records: &[Record]) -> Result<()>;
}

/// Durable persistence for reindex jobs, including atomic lease acquisition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails `Conflict` when any non-terminal job exists.
    async fn create_job(&self, params: ReindexJobParams) -> Result<ReindexJobRecord>;

    async fn get_job(&self, id: Uuid) -> Result<ReindexJobRecord>;

    /// Conditional replace keyed on `job.etag`. Returns the stored record
    /// with a fresh etag. Fails `PreconditionFailed` on etag mismatch,
    /// `Conflict` when the stored job is already terminal, `ResourceNotFound`
    /// when purged.
    async fn update_job(&self, job: &ReindexJobRecord) -> Result<ReindexJobRecord>;

    /// Claim up to `max_jobs` jobs that are `Queued` or `Running` and whose
    /// lease was never stamped or is older than `heartbeat_threshold`.
    ///
    /// Atomic per job: every returned job has `heartbeat_at` stamped to now
    /// and a fresh etag before the call returns, so concurrent callers in
    /// other processes cannot both claim the same job.
    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        heartbeat_threshold: chrono::Duration,
    ) -> Result<Vec<ReindexJobRecord>>;

    /// The single non-terminal job, if any.
    async fn check_active(&self) -> Result<Option<Uuid>>;

    /// Most recent jobs, newest first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<ReindexJobRecord>>;

    /// Administrative purge. Only terminal jobs may be removed; returns
    /// whether a row was deleted.
    async fn purge_job(&self, id: Uuid) -> Result<bool>;
}

/// Convenience supertrait for components that need both resource access and
/// the reindex write path.
pub trait StoreBackend: ResourceStore + IndexWriter {}

impl<T: ResourceStore + IndexWriter> StoreBackend for T {}

/// Stamp a freshly-read record's payload with embedded meta when possible.
///
/// Shared by backends on the read path: records whose payload was rewritten
/// by a later version keep `meta_embedded == false` until a reader patches
/// them.
pub(crate) fn patch_meta_on_read(mut record: Record) -> Record {
    if record.meta_embedded || record.deleted {
        return record;
    }
    if let Some(patched) =
        crate::models::embed_meta(&record.raw, record.version_id, record.last_updated)
    {
        record.raw = patched;
        record.meta_embedded = true;
    }
    record
}

pub(crate) fn stamp_time(ts: DateTime<Utc>) -> DateTime<Utc> {
    crate::models::truncate_to_micros(ts)
}
