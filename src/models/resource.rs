//! Resource envelope and addressing types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::IndexRow;

/// Address of a resource: `(type, logical id)` plus an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
    pub version_id: Option<i32>,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: None,
        }
    }

    pub fn versioned(resource_type: impl Into<String>, id: impl Into<String>, version_id: i32) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: Some(version_id),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version_id {
            Some(v) => write!(f, "{}/{}/_history/{}", self.resource_type, self.id, v),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

/// HTTP verb that produced a version. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Post,
    Put,
    Delete,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Delete => "DELETE",
        }
    }
}

/// Immutable resource envelope: headers, opaque payload bytes, and the index
/// rows extracted from the payload.
///
/// `version_id` and `last_updated` are assigned by the store on write; values
/// supplied by the caller are ignored. `meta_embedded` records whether `raw`
/// is known to contain `meta.versionId == version_id` and
/// `meta.lastUpdated == last_updated`, so readers can patch meta lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub resource_type: String,
    pub id: String,
    pub version_id: i32,
    pub deleted: bool,
    pub last_updated: DateTime<Utc>,
    pub request_method: RequestMethod,
    pub raw: Vec<u8>,
    pub meta_embedded: bool,
    /// Identifies the extraction-rule set in effect when `index_rows` was
    /// produced. `None` on rows written by older schemas: treat as stale.
    pub search_param_hash: Option<String>,
    pub index_rows: BTreeSet<IndexRow>,
}

impl Record {
    /// Build an envelope for an incoming write. Version and timestamps are
    /// placeholders until the store assigns them.
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        raw: Vec<u8>,
        request_method: RequestMethod,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: 0,
            deleted: false,
            last_updated: Utc::now(),
            request_method,
            raw,
            meta_embedded: false,
            search_param_hash: None,
            index_rows: BTreeSet::new(),
        }
    }

    pub fn with_index(mut self, hash: impl Into<String>, rows: BTreeSet<IndexRow>) -> Self {
        self.search_param_hash = Some(hash.into());
        self.index_rows = rows;
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::versioned(self.resource_type.clone(), self.id.clone(), self.version_id)
    }

    /// Whether the envelope marks a delete tombstone. Tombstones may carry an
    /// empty payload.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Truncate to microsecond precision to match PostgreSQL timestamptz storage.
/// Without this, nanosecond-precision timestamps (common on Linux) round-trip
/// differently through the database than through in-memory copies.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let us = (ts.timestamp_subsec_nanos() / 1_000) * 1_000;
    DateTime::from_timestamp(ts.timestamp(), us).unwrap_or(ts)
}

/// Rewrite `meta.versionId` and `meta.lastUpdated` inside a JSON payload.
///
/// Returns `None` when the payload is not a JSON object; those payloads keep
/// `meta_embedded = false` and are patched on read instead.
pub fn embed_meta(raw: &[u8], version_id: i32, last_updated: DateTime<Utc>) -> Option<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    let obj = value.as_object_mut()?;

    let meta = obj
        .entry("meta".to_string())
        .or_insert_with(|| serde_json::json!({}));
    let meta_obj = meta.as_object_mut()?;
    meta_obj.insert(
        "versionId".to_string(),
        serde_json::json!(version_id.to_string()),
    );
    meta_obj.insert(
        "lastUpdated".to_string(),
        serde_json::json!(truncate_to_micros(last_updated).to_rfc3339()),
    );

    serde_json::to_vec(&value).ok()
}
