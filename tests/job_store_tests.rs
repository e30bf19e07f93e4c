//! Integration tests for the durable job store: etag-conditional updates,
//! terminal immutability, claim stamping, and administrative purge.

mod support;

use flint::db::JobStore;
use flint::models::{ReindexJobParams, ReindexJobStatus};
use flint::ErrorKind;
use support::TestEnv;

#[tokio::test]
async fn update_requires_matching_etag() {
    let env = TestEnv::new();
    let job = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();

    let mut first = job.clone();
    first.status = ReindexJobStatus::Running;
    let stored = env.jobs.update_job(&first).await.unwrap();
    assert_ne!(stored.etag, job.etag);

    // The original etag is stale now.
    let mut second = job;
    second.status = ReindexJobStatus::Paused;
    let err = env.jobs.update_job(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn terminal_jobs_are_immutable() {
    let env = TestEnv::new();
    let job = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();

    let mut done = job.clone();
    done.status = ReindexJobStatus::Completed;
    let done = env.jobs.update_job(&done).await.unwrap();

    let mut reopen = done;
    reopen.status = ReindexJobStatus::Running;
    let err = env.jobs.update_job(&reopen).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn get_of_unknown_job_is_not_found() {
    let env = TestEnv::new();
    let err = env.jobs.get_job(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn acquire_stamps_heartbeat_and_etag() {
    let env = TestEnv::new();
    let job = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();
    assert!(job.heartbeat_at.is_none());

    let claimed = env
        .jobs
        .acquire_jobs(5, chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let claimed = &claimed[0];
    assert!(claimed.heartbeat_at.is_some());
    assert_ne!(claimed.etag, job.etag);

    // A fresh claim holds the lease; nothing further to acquire.
    assert!(env
        .jobs
        .acquire_jobs(5, chrono::Duration::seconds(60))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn check_active_tracks_the_single_open_job() {
    let env = TestEnv::new();
    assert!(env.jobs.check_active().await.unwrap().is_none());

    let job = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();
    assert_eq!(env.jobs.check_active().await.unwrap(), Some(job.id));

    let mut done = job.clone();
    done.status = ReindexJobStatus::Failed;
    done.failure_reason = Some("boom".to_string());
    env.jobs.update_job(&done).await.unwrap();
    assert!(env.jobs.check_active().await.unwrap().is_none());
}

#[tokio::test]
async fn purge_removes_only_terminal_jobs() {
    let env = TestEnv::new();
    let job = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();

    assert!(!env.jobs.purge_job(job.id).await.unwrap());

    let mut done = job.clone();
    done.status = ReindexJobStatus::Canceled;
    env.jobs.update_job(&done).await.unwrap();

    assert!(env.jobs.purge_job(job.id).await.unwrap());
    let err = env.jobs.get_job(job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn list_jobs_returns_newest_first() {
    let env = TestEnv::new();

    let first = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();
    let mut done = first.clone();
    done.status = ReindexJobStatus::Completed;
    env.jobs.update_job(&done).await.unwrap();

    let second = env.jobs.create_job(ReindexJobParams::default()).await.unwrap();

    let listed = env.jobs.list_jobs(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
}
