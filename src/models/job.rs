//! Reindex job record and its state machine vocabulary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexJobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Canceled,
    Failed,
}

impl ReindexJobStatus {
    /// Terminal jobs are immutable; only administrative purge removes them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReindexJobStatus::Completed | ReindexJobStatus::Canceled | ReindexJobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexJobStatus::Queued => "queued",
            ReindexJobStatus::Running => "running",
            ReindexJobStatus::Paused => "paused",
            ReindexJobStatus::Completed => "completed",
            ReindexJobStatus::Canceled => "canceled",
            ReindexJobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ReindexJobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(ReindexJobStatus::Queued),
            "running" => Ok(ReindexJobStatus::Running),
            "paused" => Ok(ReindexJobStatus::Paused),
            "completed" => Ok(ReindexJobStatus::Completed),
            "canceled" => Ok(ReindexJobStatus::Canceled),
            "failed" => Ok(ReindexJobStatus::Failed),
            other => Err(crate::Error::Internal(format!(
                "Unknown reindex job status: {other}"
            ))),
        }
    }
}

/// Per-resource-type progress counters. `total` is fixed once computed at job
/// start; `processed` and `failed` only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCount {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
}

impl ResourceCount {
    pub fn remaining(&self) -> i64 {
        (self.total - self.processed - self.failed).max(0)
    }
}

/// The rule scope a job targets: search-parameter URLs plus the per-type
/// parameter-set hash expected once reindexing of that type completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexJobParams {
    /// Search-parameter URLs to promote on completion. Empty at creation
    /// means "discover every supported-but-not-searchable parameter".
    #[serde(default)]
    pub target_urls: Vec<String>,
    /// Resource type -> expected `search_param_hash` after reindexing.
    #[serde(default)]
    pub expected_hashes: BTreeMap<String, String>,
}

/// Keyset cursor: the resource type currently being paged and the last
/// logical id already processed within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub resource_type: String,
    pub after_id: Option<String>,
}

/// Durable reindex job record.
///
/// `etag` is a server-chosen opaque token bumped on every update and is the
/// sole protection for lease ownership: a worker that cannot checkpoint also
/// cannot renew its lease. `heartbeat_at` is `None` until the first claim;
/// a job is claimable when its lease was never stamped or has expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexJobRecord {
    pub id: Uuid,
    pub status: ReindexJobStatus,
    pub etag: String,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub params: ReindexJobParams,
    pub resource_counts: BTreeMap<String, ResourceCount>,
    pub continuation: Option<Continuation>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl ReindexJobRecord {
    pub fn new(params: ReindexJobParams) -> Self {
        let now = crate::models::truncate_to_micros(Utc::now());
        Self {
            id: Uuid::new_v4(),
            status: ReindexJobStatus::Queued,
            etag: Uuid::new_v4().to_string(),
            heartbeat_at: None,
            params,
            resource_counts: BTreeMap::new(),
            continuation: None,
            created_at: now,
            last_modified: now,
            canceled_at: None,
            failure_reason: None,
        }
    }

    /// Whether the lease on this job has lapsed (or was never stamped).
    pub fn heartbeat_expired(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.heartbeat_at {
            Some(heartbeat_at) => now - heartbeat_at > threshold,
            None => true,
        }
    }

    pub fn total_processed(&self) -> i64 {
        self.resource_counts.values().map(|c| c.processed).sum()
    }

    pub fn total_resources(&self) -> i64 {
        self.resource_counts.values().map(|c| c.total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ReindexJobStatus::Completed.is_terminal());
        assert!(ReindexJobStatus::Canceled.is_terminal());
        assert!(ReindexJobStatus::Failed.is_terminal());
        assert!(!ReindexJobStatus::Queued.is_terminal());
        assert!(!ReindexJobStatus::Running.is_terminal());
        assert!(!ReindexJobStatus::Paused.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ReindexJobStatus::Queued,
            ReindexJobStatus::Running,
            ReindexJobStatus::Paused,
            ReindexJobStatus::Completed,
            ReindexJobStatus::Canceled,
            ReindexJobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ReindexJobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn heartbeat_expiry_uses_threshold() {
        let mut job = ReindexJobRecord::new(ReindexJobParams::default());
        let now = Utc::now();

        // Never stamped: claimable.
        assert!(job.heartbeat_expired(chrono::Duration::seconds(60), now));

        job.heartbeat_at = Some(now - chrono::Duration::seconds(120));
        assert!(job.heartbeat_expired(chrono::Duration::seconds(60), now));
        assert!(!job.heartbeat_expired(chrono::Duration::seconds(300), now));
    }
}
