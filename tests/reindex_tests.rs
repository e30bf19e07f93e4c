//! Integration tests for the reindex coordinator: end-to-end reindexing,
//! cancellation consistency, lease recovery, and the worker loop.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flint::db::{JobStore, ResourceStore, UpsertOptions};
use flint::models::{ReindexJobStatus, ResourceKey};
use flint::reindex::{
    cancel_reindex, create_reindex, get_reindex, AdaptiveThrottle, BatchDirective, ReindexTask,
    ReindexWorker, ReindexWorkerConfig, TaskExit, ThrottleOracle,
};
use flint::search::{SearchParamStatus, SupportResolver};
use flint::ErrorKind;
use support::{code_param, date_param, observation_payload, subject_param, TestEnv};

/// Throttle that runs single-record batches and parks after a set number of
/// them, so tests can interrupt a job at a known point.
struct GatedThrottle {
    batches: AtomicU32,
    open_batches: u32,
}

impl GatedThrottle {
    fn new(open_batches: u32) -> Self {
        Self {
            batches: AtomicU32::new(0),
            open_batches,
        }
    }
}

impl ThrottleOracle for GatedThrottle {
    fn next_batch(&self) -> BatchDirective {
        let seen = self.batches.fetch_add(1, Ordering::SeqCst);
        BatchDirective {
            batch_size: 1,
            delay: if seen < self.open_batches {
                Duration::ZERO
            } else {
                Duration::from_secs(60)
            },
        }
    }

    fn observe_rate_limited(&self) {}

    fn observe_success(&self) {}
}

async fn seed_observations(env: &TestEnv, count: usize) {
    for n in 0..count {
        env.write(
            "Observation",
            &format!("obs-{n:02}"),
            observation_payload(&format!("obs-{n:02}"), "8867-4"),
            UpsertOptions::new(),
        )
        .await
        .unwrap();
    }
}

fn spawn_task(
    env: &TestEnv,
    throttle: Arc<dyn ThrottleOracle>,
    job: flint::models::ReindexJobRecord,
) -> (
    tokio::task::JoinHandle<TaskExit>,
    tokio::sync::watch::Sender<bool>,
    tokio::sync::watch::Sender<bool>,
) {
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = ReindexTask::new(env.ctx(throttle), job, cancel_rx, shutdown_rx);
    (tokio::spawn(task.run()), cancel_tx, shutdown_tx)
}

#[tokio::test]
async fn reindex_rebuilds_hashes_and_promotes_parameters() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));

    seed_observations(&env, 5).await;
    let hash_a = env.registry.hash("Observation").await.unwrap();

    // A new extraction rule arrives: supported, not yet searchable.
    env.registry.register(date_param(SearchParamStatus::Supported));
    let hash_b = env.registry.hash("Observation").await.unwrap();
    assert_ne!(hash_a, hash_b);

    let before = env
        .store
        .get(&ResourceKey::new("Observation", "obs-00"))
        .await
        .unwrap();
    assert_eq!(before.search_param_hash.as_deref(), Some(hash_a.as_str()));

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    assert_eq!(job.status, ReindexJobStatus::Queued);

    let claimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let (handle, _cancel, _shutdown) = spawn_task(
        &env,
        Arc::new(AdaptiveThrottle::new(2)),
        claimed.into_iter().next().unwrap(),
    );
    assert_eq!(handle.await.unwrap(), TaskExit::Completed);

    let done = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
    assert_eq!(done.status, ReindexJobStatus::Completed);
    let counts = &done.resource_counts["Observation"];
    assert_eq!(counts.total, 5);
    assert_eq!(counts.processed, 5);
    assert_eq!(counts.failed, 0);
    assert!(done.continuation.is_none());

    // Every record carries the new hash, new index rows, and its old version.
    for n in 0..5 {
        let record = env
            .store
            .get(&ResourceKey::new("Observation", format!("obs-{n:02}")))
            .await
            .unwrap();
        assert_eq!(record.version_id, 1, "reindex must not bump versions");
        assert_eq!(record.search_param_hash.as_deref(), Some(hash_b.as_str()));
        assert!(record
            .index_rows
            .iter()
            .any(|row| row.param_url == date_param(SearchParamStatus::Supported).url));
    }

    // The new parameter is now searchable.
    let searchable = env
        .registry
        .searchable_parameters("Observation")
        .await
        .unwrap();
    assert!(searchable
        .iter()
        .any(|p| p.url == date_param(SearchParamStatus::Supported).url));
    assert!(env
        .registry
        .supported_but_not_searchable("Observation")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reindex_with_nothing_pending_completes_immediately() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));
    seed_observations(&env, 2).await;

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    let claimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap();

    let (handle, _cancel, _shutdown) = spawn_task(
        &env,
        Arc::new(AdaptiveThrottle::new(100)),
        claimed.into_iter().next().unwrap(),
    );
    assert_eq!(handle.await.unwrap(), TaskExit::Completed);

    let done = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
    assert_eq!(done.status, ReindexJobStatus::Completed);
    assert!(done.resource_counts.is_empty());
}

#[tokio::test]
async fn cancellation_leaves_consistent_indices() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));
    seed_observations(&env, 6).await;
    let hash_a = env.registry.hash("Observation").await.unwrap();

    env.registry.register(subject_param(SearchParamStatus::Supported));
    let hash_b = env.registry.hash("Observation").await.unwrap();

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    let claimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap();

    // Two single-record batches run, then the task parks in its throttle
    // delay until canceled.
    let (handle, cancel_tx, _shutdown) = spawn_task(
        &env,
        Arc::new(GatedThrottle::new(2)),
        claimed.into_iter().next().unwrap(),
    );

    loop {
        let snapshot = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
        if snapshot.total_processed() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), TaskExit::Canceled);

    let done = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
    assert_eq!(done.status, ReindexJobStatus::Canceled);
    assert!(done.canceled_at.is_some());

    // No record mixes rule sets: a record either still carries the old hash
    // with no subject rows, or the new hash with subject rows.
    let subject_url = subject_param(SearchParamStatus::Supported).url;
    let mut rebuilt = 0;
    for n in 0..6 {
        let record = env
            .store
            .get(&ResourceKey::new("Observation", format!("obs-{n:02}")))
            .await
            .unwrap();
        let has_subject_rows = record
            .index_rows
            .iter()
            .any(|row| row.param_url == subject_url);
        match record.search_param_hash.as_deref() {
            Some(h) if h == hash_b => {
                assert!(has_subject_rows);
                rebuilt += 1;
            }
            Some(h) if h == hash_a => assert!(!has_subject_rows),
            other => panic!("unexpected hash {other:?}"),
        }
    }
    assert_eq!(rebuilt, 2);
}

#[tokio::test]
async fn expired_lease_is_reacquired_and_resumes_from_continuation() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));
    seed_observations(&env, 6).await;

    env.registry.register(date_param(SearchParamStatus::Supported));
    let hash_b = env.registry.hash("Observation").await.unwrap();

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();

    // Worker A claims the job, processes two records, then stops
    // heartbeating (simulated crash).
    let claimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap();
    let (handle_a, _cancel_a, _shutdown_a) = spawn_task(
        &env,
        Arc::new(GatedThrottle::new(3)),
        claimed.into_iter().next().unwrap(),
    );

    loop {
        let snapshot = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
        if snapshot.total_processed() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle_a.abort();
    let _ = handle_a.await;

    // Before the heartbeat threshold lapses nobody can claim it.
    assert!(env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap()
        .is_empty());

    // Worker B claims after expiry and resumes from the checkpoint.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reclaimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::milliseconds(20))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    let resumed = reclaimed.into_iter().next().unwrap();
    assert_eq!(resumed.status, ReindexJobStatus::Running);
    assert!(resumed.continuation.is_some());

    let (handle_b, _cancel_b, _shutdown_b) =
        spawn_task(&env, Arc::new(AdaptiveThrottle::new(2)), resumed);
    assert_eq!(handle_b.await.unwrap(), TaskExit::Completed);

    let done = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
    assert_eq!(done.status, ReindexJobStatus::Completed);
    let counts = &done.resource_counts["Observation"];
    assert_eq!(counts.total, 6);
    assert_eq!(counts.processed, 6);

    for n in 0..6 {
        let record = env
            .store
            .get(&ResourceKey::new("Observation", format!("obs-{n:02}")))
            .await
            .unwrap();
        assert_eq!(record.search_param_hash.as_deref(), Some(hash_b.as_str()));
    }
}

#[tokio::test]
async fn concurrent_acquirers_cannot_share_a_job() {
    let env = Arc::new(TestEnv::new());
    create_reindex(env.jobs.as_ref(), None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let env = env.clone();
        handles.push(tokio::spawn(async move {
            env.jobs
                .acquire_jobs(1, chrono::Duration::seconds(60))
                .await
                .unwrap()
                .len()
        }));
    }

    let total: usize = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn only_one_job_may_be_active() {
    let env = TestEnv::new();

    let first = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    let err = create_reindex(env.jobs.as_ref(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Canceling the active job frees the slot.
    cancel_reindex(env.jobs.as_ref(), None, first.id)
        .await
        .unwrap();
    create_reindex(env.jobs.as_ref(), None).await.unwrap();
}

#[tokio::test]
async fn cancel_of_terminal_job_is_rejected() {
    let env = TestEnv::new();

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    cancel_reindex(env.jobs.as_ref(), None, job.id)
        .await
        .unwrap();

    let err = cancel_reindex(env.jobs.as_ref(), None, job.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestNotValid);
}

#[tokio::test]
async fn worker_loop_drives_a_job_to_completion() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));
    seed_observations(&env, 4).await;
    env.registry.register(date_param(SearchParamStatus::Supported));
    let hash_b = env.registry.hash("Observation").await.unwrap();

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();

    let config = ReindexWorkerConfig {
        max_concurrent_jobs: 1,
        poll_interval: Duration::from_millis(20),
        heartbeat_threshold: chrono::Duration::seconds(60),
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = ReindexWorker::new(
        env.ctx(Arc::new(AdaptiveThrottle::new(2))),
        config,
        shutdown_rx,
    );
    let worker_handle = tokio::spawn(worker.run());

    let done = loop {
        let snapshot = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(done.status, ReindexJobStatus::Completed);

    shutdown_tx.send(true).unwrap();
    worker_handle.await.unwrap().unwrap();

    let record = env
        .store
        .get(&ResourceKey::new("Observation", "obs-00"))
        .await
        .unwrap();
    assert_eq!(record.search_param_hash.as_deref(), Some(hash_b.as_str()));
}

#[tokio::test]
async fn worker_shutdown_leaves_job_for_lease_recovery() {
    let env = TestEnv::new();
    env.registry.register(code_param(SearchParamStatus::Searchable));
    seed_observations(&env, 6).await;
    env.registry.register(date_param(SearchParamStatus::Supported));

    let job = create_reindex(env.jobs.as_ref(), None).await.unwrap();
    let claimed = env
        .jobs
        .acquire_jobs(1, chrono::Duration::seconds(60))
        .await
        .unwrap();

    let (handle, _cancel, shutdown_tx) = spawn_task(
        &env,
        Arc::new(GatedThrottle::new(2)),
        claimed.into_iter().next().unwrap(),
    );

    loop {
        let snapshot = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
        if snapshot.total_processed() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), TaskExit::Shutdown);

    // The job is still Running; it was not canceled by the terminating
    // worker and resumes elsewhere once the lease expires.
    let parked = get_reindex(env.jobs.as_ref(), job.id).await.unwrap();
    assert_eq!(parked.status, ReindexJobStatus::Running);
    assert!(parked.continuation.is_some());
}
