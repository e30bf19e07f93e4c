//! Per-job reindex state machine.
//!
//! A task owns one leased job and drives it Queued -> Running -> terminal,
//! checkpointing progress through the job store on every batch. Heartbeat and
//! checkpoint are deliberately the same write: a worker that cannot make
//! forward progress also cannot renew its lease.

use std::collections::BTreeSet;
use std::ops::Bound;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::ErrorKind;
use crate::models::{
    truncate_to_micros, Continuation, Record, ReindexJobRecord, ReindexJobStatus, ResourceCount,
};
use crate::reindex::ReindexContext;
use crate::{Error, Result};

/// How a task left its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Canceled,
    Failed,
    /// Another worker stamped the lease; the job continues elsewhere.
    LeaseLost,
    /// The worker process is terminating; the job stays `Running` and will be
    /// re-acquired once its heartbeat expires.
    Shutdown,
}

/// Outcome of one checkpoint write.
enum Checkpoint {
    Persisted,
    Canceled,
    LeaseLost,
}

const TRANSIENT_RETRIES: u32 = 3;

pub struct ReindexTask {
    ctx: ReindexContext,
    job: ReindexJobRecord,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl ReindexTask {
    pub fn new(
        ctx: ReindexContext,
        job: ReindexJobRecord,
        cancel: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            job,
            cancel,
            shutdown,
        }
    }

    pub async fn run(mut self) -> TaskExit {
        let job_id = self.job.id;
        let exit = match self.drive().await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Reindex job failed");
                self.finish_failed(&e).await
            }
        };

        match exit {
            TaskExit::Completed => tracing::info!(%job_id, "Reindex job completed"),
            TaskExit::Canceled => tracing::info!(%job_id, "Reindex job canceled"),
            TaskExit::Failed => tracing::warn!(%job_id, "Reindex job marked failed"),
            TaskExit::LeaseLost => tracing::warn!(%job_id, "Reindex lease lost to another worker"),
            TaskExit::Shutdown => tracing::info!(%job_id, "Reindex task yielding for shutdown"),
        }
        exit
    }

    async fn drive(&mut self) -> Result<TaskExit> {
        if self.job.status == ReindexJobStatus::Queued {
            if let Some(exit) = self.initialize().await? {
                return Ok(exit);
            }
        }

        while let Some(cont) = self.job.continuation.clone() {
            if *self.shutdown.borrow() {
                return Ok(TaskExit::Shutdown);
            }
            if *self.cancel.borrow() {
                return Ok(self.finish_canceled().await);
            }

            let directive = self.ctx.throttle.next_batch();
            if !directive.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(directive.delay) => {}
                    _ = self.cancel.changed() => continue,
                    _ = self.shutdown.changed() => continue,
                }
            }

            let page = match self
                .ctx
                .store
                .page_current(&cont.resource_type, cont.after_id.as_deref(), directive.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) if e.kind() == ErrorKind::RateLimited => {
                    self.ctx.throttle.observe_rate_limited();
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "Transient page read failure");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if page.is_empty() {
                // Current type exhausted; move to the next one.
                self.job.continuation = self.next_continuation(&cont.resource_type);
                match self.checkpoint().await? {
                    Checkpoint::Persisted => continue,
                    Checkpoint::Canceled => return Ok(TaskExit::Canceled),
                    Checkpoint::LeaseLost => return Ok(TaskExit::LeaseLost),
                }
            }

            let last_id = page.last().map(|r| r.id.clone());
            let (processed, failed) = self.reindex_page(&cont.resource_type, page).await?;

            let counts = self
                .job
                .resource_counts
                .entry(cont.resource_type.clone())
                .or_insert_with(ResourceCount::default);
            counts.processed += processed;
            counts.failed += failed;

            self.job.continuation = Some(Continuation {
                resource_type: cont.resource_type,
                after_id: last_id,
            });
            self.ctx.throttle.observe_success();

            match self.checkpoint().await? {
                Checkpoint::Persisted => {}
                Checkpoint::Canceled => return Ok(TaskExit::Canceled),
                Checkpoint::LeaseLost => return Ok(TaskExit::LeaseLost),
            }
        }

        // Every targeted type is exhausted and its records carry the expected
        // hash: the new parameters are proven complete.
        self.ctx
            .resolver
            .promote(&self.job.params.target_urls)
            .await?;

        self.job.status = ReindexJobStatus::Completed;
        match self.checkpoint().await? {
            Checkpoint::Persisted => Ok(TaskExit::Completed),
            Checkpoint::Canceled => Ok(TaskExit::Canceled),
            Checkpoint::LeaseLost => Ok(TaskExit::LeaseLost),
        }
    }

    /// Queued -> Running: fix the target set, expected hashes, and totals.
    ///
    /// `total` is computed once here; resources created after this point are
    /// not part of the job.
    async fn initialize(&mut self) -> Result<Option<TaskExit>> {
        let scoped = !self.job.params.target_urls.is_empty();
        let mut target_urls: BTreeSet<String> =
            self.job.params.target_urls.iter().cloned().collect();

        let candidate_types: Vec<String> = if scoped {
            self.ctx.store.list_types().await?
        } else {
            let pending: BTreeSet<String> = self
                .ctx
                .resolver
                .types_with_pending_parameters()
                .await?
                .into_iter()
                .collect();
            self.ctx
                .store
                .list_types()
                .await?
                .into_iter()
                .filter(|t| pending.contains(t))
                .collect()
        };

        for resource_type in candidate_types {
            let pending = self
                .ctx
                .resolver
                .supported_but_not_searchable(&resource_type)
                .await?;
            let relevant: Vec<_> = if scoped {
                pending
                    .into_iter()
                    .filter(|p| target_urls.contains(&p.url))
                    .collect()
            } else {
                pending
            };
            if relevant.is_empty() {
                continue;
            }

            for param in &relevant {
                target_urls.insert(param.url.clone());
            }
            let expected = self.ctx.resolver.hash(&resource_type).await?;
            self.job
                .params
                .expected_hashes
                .insert(resource_type.clone(), expected);
            self.job.resource_counts.insert(
                resource_type.clone(),
                ResourceCount {
                    total: self.ctx.store.count_current(&resource_type).await?,
                    processed: 0,
                    failed: 0,
                },
            );
        }

        self.job.params.target_urls = target_urls.into_iter().collect();

        if self.job.params.target_urls.is_empty() {
            // Nothing is pending; the job completes without touching a row.
            self.job.status = ReindexJobStatus::Completed;
            return Ok(Some(match self.checkpoint().await? {
                Checkpoint::Persisted => TaskExit::Completed,
                Checkpoint::Canceled => TaskExit::Canceled,
                Checkpoint::LeaseLost => TaskExit::LeaseLost,
            }));
        }

        self.job.continuation =
            self.job
                .resource_counts
                .keys()
                .next()
                .map(|resource_type| Continuation {
                    resource_type: resource_type.clone(),
                    after_id: None,
                });
        self.job.status = ReindexJobStatus::Running;

        match self.checkpoint().await? {
            Checkpoint::Persisted => Ok(None),
            Checkpoint::Canceled => Ok(Some(TaskExit::Canceled)),
            Checkpoint::LeaseLost => Ok(Some(TaskExit::LeaseLost)),
        }
    }

    /// Extract and rewrite index rows for one page of records.
    ///
    /// Returns `(processed, failed)` counter deltas.
    async fn reindex_page(
        &mut self,
        resource_type: &str,
        page: Vec<Record>,
    ) -> Result<(i64, i64)> {
        let expected_hash = self
            .job
            .params
            .expected_hashes
            .get(resource_type)
            .cloned()
            .ok_or_else(|| {
                Error::Internal(format!("No expected hash recorded for {resource_type}"))
            })?;

        let mut params = self
            .ctx
            .resolver
            .searchable_parameters(resource_type)
            .await?;
        params.extend(
            self.ctx
                .resolver
                .supported_but_not_searchable(resource_type)
                .await?,
        );

        let mut failed: i64 = 0;
        let mut updated = Vec::with_capacity(page.len());
        for record in page {
            match self
                .ctx
                .indexer
                .extract(resource_type, &record.raw, &params)
            {
                Ok(rows) => {
                    let mut rewrite = record;
                    rewrite.index_rows = rows;
                    rewrite.search_param_hash = Some(expected_hash.clone());
                    updated.push(rewrite);
                }
                Err(e) => {
                    tracing::warn!(
                        resource_type,
                        id = %record.id,
                        error = %e,
                        "Index extraction failed"
                    );
                    failed += 1;
                }
            }
        }

        let (ok, write_failed) = self.write_batch(&updated).await?;
        Ok((ok, failed + write_failed))
    }

    /// Write one batch through the index writer.
    ///
    /// The batch precondition is atomic; when it fails, fall back to
    /// per-record writes so one concurrently-updated record does not starve
    /// the rest of the page. A per-record precondition failure means a
    /// regular writer re-versioned that record and already produced rows for
    /// the current rule set, so it counts as processed.
    async fn write_batch(&self, records: &[Record]) -> Result<(i64, i64)> {
        if records.is_empty() {
            return Ok((0, 0));
        }

        let mut attempts = 0;
        loop {
            match self.ctx.store.update_indices_batch(records).await {
                Ok(()) => return Ok((records.len() as i64, 0)),
                Err(e) if e.kind() == ErrorKind::RateLimited && attempts < TRANSIENT_RETRIES => {
                    attempts += 1;
                    self.ctx.throttle.observe_rate_limited();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::PreconditionFailed | ErrorKind::NotFound
                    ) =>
                {
                    break;
                }
                Err(e) if e.is_retryable() && attempts < TRANSIENT_RETRIES => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut ok: i64 = 0;
        let mut failed: i64 = 0;
        for record in records {
            match self.ctx.store.update_index(record, record.version_id).await {
                Ok(()) => ok += 1,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::PreconditionFailed | ErrorKind::NotFound
                    ) =>
                {
                    ok += 1;
                }
                Err(e) if e.kind() == ErrorKind::RateLimited => {
                    self.ctx.throttle.observe_rate_limited();
                    failed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        resource_type = %record.resource_type,
                        id = %record.id,
                        error = %e,
                        "Index rewrite failed"
                    );
                    failed += 1;
                }
            }
        }
        Ok((ok, failed))
    }

    /// Persist the job: progress checkpoint and lease renewal in one write.
    async fn checkpoint(&mut self) -> Result<Checkpoint> {
        self.job.heartbeat_at = Some(truncate_to_micros(Utc::now()));

        let mut attempts = 0;
        loop {
            match self.ctx.jobs.update_job(&self.job).await {
                Ok(stored) => {
                    self.job = stored;
                    return Ok(Checkpoint::Persisted);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::PreconditionFailed | ErrorKind::Conflict
                    ) =>
                {
                    // Someone else wrote the job: a cancel command, or a
                    // worker that re-acquired an expired lease.
                    let stored = self.ctx.jobs.get_job(self.job.id).await?;
                    if stored.status == ReindexJobStatus::Canceled {
                        return Ok(Checkpoint::Canceled);
                    }
                    return Ok(Checkpoint::LeaseLost);
                }
                Err(e) if e.is_retryable() && attempts < TRANSIENT_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(100 << attempts)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_continuation(&self, current_type: &str) -> Option<Continuation> {
        self.job
            .resource_counts
            .range::<str, _>((Bound::Excluded(current_type), Bound::Unbounded))
            .next()
            .map(|(resource_type, _)| Continuation {
                resource_type: resource_type.clone(),
                after_id: None,
            })
    }

    async fn finish_canceled(&mut self) -> TaskExit {
        self.job.status = ReindexJobStatus::Canceled;
        self.job.canceled_at = Some(truncate_to_micros(Utc::now()));
        if let Err(e) = self.checkpoint().await {
            tracing::error!(job_id = %self.job.id, error = %e, "Failed to persist cancellation");
        }
        TaskExit::Canceled
    }

    async fn finish_failed(&mut self, cause: &Error) -> TaskExit {
        // Index rows already written stay: each is correct in isolation.
        self.job.status = ReindexJobStatus::Failed;
        self.job.failure_reason = Some(cause.to_string());
        if let Err(persist_err) = self.checkpoint().await {
            tracing::error!(
                job_id = %self.job.id,
                error = %persist_err,
                "Failed to persist failure status"
            );
        }
        TaskExit::Failed
    }
}
