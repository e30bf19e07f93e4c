//! In-memory `JobStore` implementation.
//!
//! Mirrors the PostgreSQL store's claim semantics: acquisition stamps the
//! heartbeat and advances the etag atomically per job, so two concurrent
//! acquirers can never both claim the same job.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::traits::JobStore;
use crate::models::{truncate_to_micros, ReindexJobParams, ReindexJobRecord, ReindexJobStatus};
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, ReindexJobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: Uuid) -> Error {
        Error::ResourceNotFound {
            resource_type: "ReindexJob".to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, params: ReindexJobParams) -> Result<ReindexJobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(active) = jobs.values().find(|j| !j.status.is_terminal()) {
            return Err(Error::Conflict(format!(
                "A reindex job is already active: {}",
                active.id
            )));
        }

        let job = ReindexJobRecord::new(params);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<ReindexJobRecord> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&id).cloned().ok_or_else(|| Self::not_found(id))
    }

    async fn update_job(&self, job: &ReindexJobRecord) -> Result<ReindexJobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let stored = jobs.get_mut(&job.id).ok_or_else(|| Self::not_found(job.id))?;

        if stored.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Reindex job {} is in terminal status {}",
                job.id,
                stored.status.as_str()
            )));
        }
        if stored.etag != job.etag {
            return Err(Error::PreconditionFailed(format!(
                "Reindex job {} was updated concurrently",
                job.id
            )));
        }

        let mut updated = job.clone();
        updated.etag = Uuid::new_v4().to_string();
        updated.last_modified = truncate_to_micros(Utc::now());
        *stored = updated.clone();
        Ok(updated)
    }

    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        heartbeat_threshold: chrono::Duration,
    ) -> Result<Vec<ReindexJobRecord>> {
        let mut jobs = self.jobs.lock().unwrap();
        let now = truncate_to_micros(Utc::now());

        let mut claimable: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                matches!(
                    j.status,
                    ReindexJobStatus::Queued | ReindexJobStatus::Running
                ) && j.heartbeat_expired(heartbeat_threshold, now)
            })
            .map(|j| (j.created_at, j.id))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        claimable.truncate(max_jobs);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let job = jobs.get_mut(&id).expect("claimable id exists");
            job.heartbeat_at = Some(now);
            job.etag = Uuid::new_v4().to_string();
            job.last_modified = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn check_active(&self) -> Result<Option<Uuid>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .find(|j| !j.status.is_terminal())
            .map(|j| j.id))
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<ReindexJobRecord>> {
        let jobs = self.jobs.lock().unwrap();
        let mut all: Vec<ReindexJobRecord> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn purge_job(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(&id) {
            Some(job) if job.status.is_terminal() => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
