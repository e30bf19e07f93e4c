//! PostgreSQL-backed `JobStore` implementation.
//!
//! Expected schema (migrations are managed outside this crate):
//!
//! ```sql
//! CREATE TABLE reindex_jobs (
//!     id            UUID PRIMARY KEY,
//!     status        TEXT NOT NULL,
//!     etag          TEXT NOT NULL,
//!     heartbeat_at  TIMESTAMPTZ,
//!     body          JSONB NOT NULL,
//!     created_at    TIMESTAMPTZ NOT NULL,
//!     last_modified TIMESTAMPTZ NOT NULL,
//!     canceled_at   TIMESTAMPTZ
//! );
//! -- At most one non-terminal job per deployment.
//! CREATE UNIQUE INDEX reindex_jobs_active ON reindex_jobs ((1))
//!     WHERE status IN ('queued', 'running', 'paused');
//! ```
//!
//! Lease acquisition is a single statement (`FOR UPDATE SKIP LOCKED` inside
//! an `UPDATE ... RETURNING`), never a client-side read-then-write: a
//! returned job already has its heartbeat stamped and etag advanced.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::traits::JobStore;
use crate::models::{truncate_to_micros, ReindexJobParams, ReindexJobRecord};
use crate::{Error, Result};

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn not_found(id: Uuid) -> Error {
        Error::ResourceNotFound {
            resource_type: "ReindexJob".to_string(),
            id: id.to_string(),
        }
    }

    fn body_of(job: &ReindexJobRecord) -> Result<serde_json::Value> {
        serde_json::to_value(job)
            .map_err(|e| Error::Internal(format!("Failed to serialize job: {e}")))
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ReindexJobRecord> {
        let body: serde_json::Value = row.get("body");
        let mut job: ReindexJobRecord = serde_json::from_value(body)
            .map_err(|e| Error::Internal(format!("Corrupt job body: {e}")))?;

        // The mirrored columns are authoritative; the body may lag one write
        // behind after an acquire.
        let status: String = row.get("status");
        job.status = status.parse()?;
        job.etag = row.get("etag");
        job.heartbeat_at = row.get("heartbeat_at");
        job.created_at = row.get("created_at");
        job.last_modified = row.get("last_modified");
        job.canceled_at = row.get("canceled_at");
        Ok(job)
    }
}

const TERMINAL_STATUSES: &str = "('completed', 'canceled', 'failed')";

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, params: ReindexJobParams) -> Result<ReindexJobRecord> {
        let job = ReindexJobRecord::new(params);
        let body = Self::body_of(&job)?;

        let result = sqlx::query(
            "INSERT INTO reindex_jobs
                 (id, status, etag, heartbeat_at, body, created_at, last_modified, canceled_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)",
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(&job.etag)
        .bind(job.heartbeat_at)
        .bind(&body)
        .bind(job.created_at)
        .bind(job.last_modified)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            // The partial unique index enforces "one active job".
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Err(Error::Conflict(
                    "A reindex job is already active".to_string(),
                ))
            }
            Err(e) => Err(Error::Database(e)),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<ReindexJobRecord> {
        let row = sqlx::query(
            "SELECT id, status, etag, heartbeat_at, body, created_at, last_modified, canceled_at
             FROM reindex_jobs
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Self::not_found(id))?;

        Self::job_from_row(&row)
    }

    async fn update_job(&self, job: &ReindexJobRecord) -> Result<ReindexJobRecord> {
        let mut updated = job.clone();
        updated.etag = Uuid::new_v4().to_string();
        updated.last_modified = truncate_to_micros(Utc::now());
        let body = Self::body_of(&updated)?;

        let result = sqlx::query(&format!(
            "UPDATE reindex_jobs
             SET status = $3, etag = $4, heartbeat_at = $5, body = $6,
                 last_modified = $7, canceled_at = $8
             WHERE id = $1 AND etag = $2 AND status NOT IN {TERMINAL_STATUSES}"
        ))
        .bind(job.id)
        .bind(&job.etag)
        .bind(updated.status.as_str())
        .bind(&updated.etag)
        .bind(updated.heartbeat_at)
        .bind(&body)
        .bind(updated.last_modified)
        .bind(updated.canceled_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            let stored = self.get_job(job.id).await?;
            if stored.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "Reindex job {} is in terminal status {}",
                    job.id,
                    stored.status.as_str()
                )));
            }
            return Err(Error::PreconditionFailed(format!(
                "Reindex job {} was updated concurrently",
                job.id
            )));
        }

        Ok(updated)
    }

    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        heartbeat_threshold: chrono::Duration,
    ) -> Result<Vec<ReindexJobRecord>> {
        let now = truncate_to_micros(Utc::now());
        let cutoff = now - heartbeat_threshold;

        let rows = sqlx::query(
            "WITH claimable AS (
                 SELECT id
                 FROM reindex_jobs
                 WHERE status IN ('queued', 'running')
                   AND (heartbeat_at IS NULL OR heartbeat_at < $1)
                 ORDER BY created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE reindex_jobs j
             SET heartbeat_at = $3,
                 etag = gen_random_uuid()::text,
                 last_modified = $3
             FROM claimable c
             WHERE j.id = c.id
             RETURNING j.id, j.status, j.etag, j.heartbeat_at, j.body,
                       j.created_at, j.last_modified, j.canceled_at",
        )
        .bind(cutoff)
        .bind(max_jobs as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn check_active(&self) -> Result<Option<Uuid>> {
        let row = sqlx::query(&format!(
            "SELECT id FROM reindex_jobs WHERE status NOT IN {TERMINAL_STATUSES} LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| r.get("id")))
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<ReindexJobRecord>> {
        let rows = sqlx::query(
            "SELECT id, status, etag, heartbeat_at, body, created_at, last_modified, canceled_at
             FROM reindex_jobs
             ORDER BY created_at DESC
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn purge_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM reindex_jobs WHERE id = $1 AND status IN {TERMINAL_STATUSES}"
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
