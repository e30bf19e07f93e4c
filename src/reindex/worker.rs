//! Reindex worker: a per-process loop that leases jobs and runs their tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::reindex::{ReindexContext, ReindexTask, TaskExit};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ReindexWorkerConfig {
    /// Ceiling for concurrently-leased jobs in this process. Also the
    /// deployment-wide ceiling when a single non-terminal job is enforced.
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    /// A lease is expired when `now - heartbeat_at` exceeds this.
    pub heartbeat_threshold: chrono::Duration,
}

impl Default for ReindexWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            poll_interval: Duration::from_secs(5),
            heartbeat_threshold: chrono::Duration::seconds(60),
        }
    }
}

/// Cancel handles of locally-running tasks, shared with the command surface
/// so `CancelReindex` can interrupt a job without waiting for its next
/// checkpoint conflict.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: Uuid, sender: watch::Sender<bool>) {
        self.inner.lock().unwrap().insert(id, sender);
    }

    fn remove(&self, id: &Uuid) {
        self.inner.lock().unwrap().remove(id);
    }

    /// Signal a locally-running task. Returns whether the job was running
    /// here.
    pub fn signal(&self, id: Uuid) -> bool {
        let handles = self.inner.lock().unwrap();
        match handles.get(&id) {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }
}

struct RunningTask {
    handle: JoinHandle<TaskExit>,
    _cancel: watch::Sender<bool>,
}

pub struct ReindexWorker {
    ctx: ReindexContext,
    config: ReindexWorkerConfig,
    running: HashMap<Uuid, RunningTask>,
    shutdown: watch::Receiver<bool>,
    cancel_registry: CancelRegistry,
}

impl ReindexWorker {
    pub fn new(
        ctx: ReindexContext,
        config: ReindexWorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            config,
            running: HashMap::new(),
            shutdown,
            cancel_registry: CancelRegistry::new(),
        }
    }

    /// Handle for the command surface to reach locally-running jobs.
    pub fn cancel_registry(&self) -> CancelRegistry {
        self.cancel_registry.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            max_concurrent = self.config.max_concurrent_jobs,
            poll_interval_seconds = self.config.poll_interval.as_secs(),
            "Reindex worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }

            self.reap().await;

            let capacity = self
                .config
                .max_concurrent_jobs
                .saturating_sub(self.running.len());
            if capacity == 0 {
                continue;
            }

            match self
                .ctx
                .jobs
                .acquire_jobs(capacity, self.config.heartbeat_threshold)
                .await
            {
                Ok(jobs) => {
                    for job in jobs {
                        self.spawn(job);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to acquire reindex jobs");
                }
            }
        }

        self.drain().await;
        tracing::info!("Reindex worker stopped");
        Ok(())
    }

    fn spawn(&mut self, job: crate::models::ReindexJobRecord) {
        let job_id = job.id;
        if self.running.contains_key(&job_id) {
            // Our own lease expired while the local task is still alive;
            // leave the running task in charge rather than double-driving.
            tracing::warn!(%job_id, "Re-acquired a job that is still running locally");
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = ReindexTask::new(
            self.ctx.clone(),
            job,
            cancel_rx,
            self.shutdown.clone(),
        );

        tracing::info!(%job_id, "Leased reindex job");
        self.cancel_registry.insert(job_id, cancel_tx.clone());
        self.running.insert(
            job_id,
            RunningTask {
                handle: tokio::spawn(task.run()),
                _cancel: cancel_tx,
            },
        );
    }

    async fn reap(&mut self) {
        let finished: Vec<Uuid> = self
            .running
            .iter()
            .filter(|(_, t)| t.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.cancel_registry.remove(&id);
            if let Some(task) = self.running.remove(&id) {
                // The task already finished; join only to observe panics.
                if let Err(e) = task.handle.await {
                    tracing::error!(job_id = %id, error = %e, "Reindex task panicked");
                }
            }
        }
    }

    /// Stop accepting leases and wait for in-flight tasks to yield. Tasks see
    /// the worker's shutdown signal and leave their jobs `Running` for lease
    /// recovery.
    async fn drain(&mut self) {
        let (ids, tasks): (Vec<Uuid>, Vec<RunningTask>) = self.running.drain().unzip();
        for id in &ids {
            self.cancel_registry.remove(id);
        }

        let results = futures::future::join_all(tasks.into_iter().map(|t| t.handle)).await;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(exit) => tracing::debug!(job_id = %id, ?exit, "Reindex task drained"),
                Err(e) => tracing::error!(job_id = %id, error = %e, "Reindex task panicked"),
            }
        }
    }
}
