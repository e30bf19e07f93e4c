//! Reindex command surface consumed by the transport layer.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::db::JobStore;
use crate::error::ErrorKind;
use crate::models::{truncate_to_micros, ReindexJobParams, ReindexJobRecord, ReindexJobStatus};
use crate::reindex::CancelRegistry;
use crate::{Error, Result};

const CANCEL_RETRIES: u32 = 5;

/// Create a reindex job. `scope` limits the job to the given search-parameter
/// URLs; an empty scope targets every supported-but-not-searchable parameter.
///
/// Fails `Conflict` when a non-terminal job already exists.
pub async fn create_reindex(
    jobs: &dyn JobStore,
    scope: Option<Vec<String>>,
) -> Result<ReindexJobRecord> {
    // Fast pre-check; the store's create enforces this atomically as well.
    if let Some(active) = jobs.check_active().await? {
        return Err(Error::Conflict(format!(
            "A reindex job is already active: {active}"
        )));
    }

    let job = jobs
        .create_job(ReindexJobParams {
            target_urls: scope.unwrap_or_default(),
            ..ReindexJobParams::default()
        })
        .await?;

    tracing::info!(job_id = %job.id, "Created reindex job");
    Ok(job)
}

pub async fn get_reindex(jobs: &dyn JobStore, id: Uuid) -> Result<ReindexJobRecord> {
    jobs.get_job(id).await
}

/// Cancel a reindex job.
///
/// Persists `Canceled` through a conditional update with bounded exponential
/// backoff, then signals the local cancel handle when the job runs in this
/// process. Workers elsewhere observe the status change at their next
/// checkpoint and abandon further batches.
pub async fn cancel_reindex(
    jobs: &dyn JobStore,
    registry: Option<&CancelRegistry>,
    id: Uuid,
) -> Result<ReindexJobRecord> {
    let mut delay = Duration::from_millis(100);
    let mut attempts = 0;

    loop {
        let job = jobs.get_job(id).await?;
        if job.status.is_terminal() {
            return Err(Error::RequestNotValid(format!(
                "Reindex job {id} is already {}",
                job.status.as_str()
            )));
        }

        let mut update = job;
        update.status = ReindexJobStatus::Canceled;
        update.canceled_at = Some(truncate_to_micros(Utc::now()));

        match jobs.update_job(&update).await {
            Ok(stored) => {
                if let Some(registry) = registry {
                    if registry.signal(id) {
                        tracing::debug!(job_id = %id, "Signaled locally-running reindex task");
                    }
                }
                tracing::info!(job_id = %id, "Reindex job canceled");
                return Ok(stored);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::PreconditionFailed | ErrorKind::Conflict
                ) && attempts < CANCEL_RETRIES =>
            {
                attempts += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
