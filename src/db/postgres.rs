//! PostgreSQL-backed `ResourceStore`/`IndexWriter` implementation.
//!
//! Expected schema (migrations are managed outside this crate):
//!
//! ```sql
//! CREATE TABLE resources (
//!     resource_type     TEXT NOT NULL,
//!     id                TEXT NOT NULL,
//!     version_id        INT NOT NULL,
//!     raw               BYTEA NOT NULL,
//!     last_updated      TIMESTAMPTZ NOT NULL,
//!     request_method    TEXT NOT NULL,
//!     deleted           BOOLEAN NOT NULL DEFAULT FALSE,
//!     is_current        BOOLEAN NOT NULL DEFAULT TRUE,
//!     meta_embedded     BOOLEAN NOT NULL DEFAULT FALSE,
//!     search_param_hash TEXT,
//!     row_version       BIGINT NOT NULL DEFAULT 1,
//!     PRIMARY KEY (resource_type, id, version_id)
//! );
//! CREATE UNIQUE INDEX resources_current ON resources (resource_type, id) WHERE is_current;
//!
//! CREATE TABLE search_index (
//!     resource_type TEXT NOT NULL,
//!     resource_id   TEXT NOT NULL,
//!     version_id    INT NOT NULL,
//!     param_url     TEXT NOT NULL,
//!     value         JSONB NOT NULL,
//!     UNIQUE (resource_type, resource_id, param_url, value)
//! );
//! ```
//!
//! Every write is a conditional replace keyed on the current row's
//! `row_version`; the upsert path retries on conflict. `search_param_hash`
//! may be NULL on rows written by older schemas; readers treat that as
//! "stale, reindex eligible".

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::db::traits::{
    patch_meta_on_read, stamp_time, IndexWriter, ResourceStore, UpsertKind, UpsertOptions,
    UpsertOutcome,
};
use crate::models::{embed_meta, Record, RequestMethod, ResourceKey};
use crate::search::{IndexRow, IndexValue};
use crate::{Error, Result};

/// PostgreSQL-backed resource store.
#[derive(Clone)]
pub struct PostgresResourceStore {
    pool: PgPool,
}

/// Head of the current row: enough to verify preconditions and key a
/// conditional replace.
struct CurrentHead {
    version_id: i32,
    deleted: bool,
    row_version: i64,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn read_head(&self, resource_type: &str, id: &str) -> Result<Option<CurrentHead>> {
        let row = sqlx::query(
            "SELECT version_id, deleted, row_version
             FROM resources
             WHERE resource_type = $1 AND id = $2 AND is_current = TRUE",
        )
        .bind(resource_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|r| CurrentHead {
            version_id: r.get("version_id"),
            deleted: r.get("deleted"),
            row_version: r.get("row_version"),
        }))
    }

    /// Assign store-owned fields for the version being written.
    fn prepare(&self, mut record: Record, version_id: i32) -> Record {
        record.version_id = version_id;
        record.last_updated = stamp_time(Utc::now());
        record.meta_embedded = false;

        if record.deleted {
            record.index_rows.clear();
            record.search_param_hash = None;
        } else if let Some(patched) = embed_meta(&record.raw, version_id, record.last_updated) {
            record.raw = patched;
            record.meta_embedded = true;
        }

        record
    }

    async fn insert_resource_row(
        tx: &mut Transaction<'_, Postgres>,
        record: &Record,
    ) -> std::result::Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO resources
                 (resource_type, id, version_id, raw, last_updated, request_method,
                  deleted, is_current, meta_embedded, search_param_hash, row_version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, 1)
             ON CONFLICT DO NOTHING",
        )
        .bind(&record.resource_type)
        .bind(&record.id)
        .bind(record.version_id)
        .bind(&record.raw)
        .bind(record.last_updated)
        .bind(record.request_method.as_str())
        .bind(record.deleted)
        .bind(record.meta_embedded)
        .bind(&record.search_param_hash)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn replace_index_rows(
        tx: &mut Transaction<'_, Postgres>,
        resource_type: &str,
        id: &str,
        version_id: i32,
        rows: &std::collections::BTreeSet<IndexRow>,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM search_index WHERE resource_type = $1 AND resource_id = $2")
            .bind(resource_type)
            .bind(id)
            .execute(&mut **tx)
            .await?;

        for row in rows {
            let value = serde_json::to_value(&row.value)
                .expect("index values serialize to JSON");
            sqlx::query(
                "INSERT INTO search_index (resource_type, resource_id, version_id, param_url, value)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT DO NOTHING",
            )
            .bind(resource_type)
            .bind(id)
            .bind(version_id)
            .bind(&row.param_url)
            .bind(value)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Blind insert of version 1. Returns false on a uniqueness collision.
    async fn try_insert(&self, record: &Record) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        if Self::insert_resource_row(&mut tx, record)
            .await
            .map_err(classify)?
            == 0
        {
            return Ok(false);
        }
        Self::replace_index_rows(
            &mut tx,
            &record.resource_type,
            &record.id,
            record.version_id,
            &record.index_rows,
        )
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(true)
    }

    /// Conditional replace of the current row, keyed on `row_version`.
    /// Returns false when the head moved and the caller must retry.
    async fn try_replace(
        &self,
        record: &Record,
        expected_row_version: i64,
        keep_history: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let displaced = if keep_history {
            sqlx::query(
                "UPDATE resources SET is_current = FALSE
                 WHERE resource_type = $1 AND id = $2 AND is_current = TRUE
                   AND row_version = $3",
            )
        } else {
            sqlx::query(
                "DELETE FROM resources
                 WHERE resource_type = $1 AND id = $2 AND is_current = TRUE
                   AND row_version = $3",
            )
        }
        .bind(&record.resource_type)
        .bind(&record.id)
        .bind(expected_row_version)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        if displaced.rows_affected() == 0 {
            return Ok(false);
        }

        match Self::insert_resource_row(&mut tx, record).await {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(false),
            Err(e) => return Err(classify(e)),
        }

        Self::replace_index_rows(
            &mut tx,
            &record.resource_type,
            &record.id,
            record.version_id,
            &record.index_rows,
        )
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(true)
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Record {
        let method: String = row.get("request_method");
        Record {
            resource_type: row.get("resource_type"),
            id: row.get("id"),
            version_id: row.get("version_id"),
            deleted: row.get("deleted"),
            last_updated: row.get("last_updated"),
            request_method: match method.as_str() {
                "POST" => RequestMethod::Post,
                "DELETE" => RequestMethod::Delete,
                _ => RequestMethod::Put,
            },
            raw: row.get("raw"),
            meta_embedded: row.get("meta_embedded"),
            search_param_hash: row.get("search_param_hash"),
            index_rows: std::collections::BTreeSet::new(),
        }
    }

    async fn load_index_rows(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<std::collections::BTreeSet<IndexRow>> {
        let rows = sqlx::query(
            "SELECT param_url, value
             FROM search_index
             WHERE resource_type = $1 AND resource_id = $2 AND version_id = $3",
        )
        .bind(resource_type)
        .bind(id)
        .bind(version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut out = std::collections::BTreeSet::new();
        for row in rows {
            let value: serde_json::Value = row.get("value");
            let value: IndexValue = serde_json::from_value(value)
                .map_err(|e| Error::Internal(format!("Corrupt index row: {e}")))?;
            out.insert(IndexRow::new(row.get::<String, _>("param_url"), value));
        }
        Ok(out)
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn upsert(&self, incoming: Record, options: UpsertOptions) -> Result<UpsertOutcome> {
        if incoming.resource_type.is_empty() || incoming.id.is_empty() {
            return Err(Error::RequestNotValid(
                "Resource type and id are required".to_string(),
            ));
        }

        if options.if_match.is_none() && options.allow_create && !incoming.deleted {
            let prepared = self.prepare(incoming.clone(), 1);
            if with_backoff(|| self.try_insert(&prepared)).await? {
                return Ok(UpsertOutcome {
                    kind: UpsertKind::Created,
                    key: prepared.key(),
                    last_updated: Some(prepared.last_updated),
                });
            }
        }

        loop {
            match with_backoff(|| self.read_head(&incoming.resource_type, &incoming.id)).await? {
                None => {
                    if options.if_match.is_some() {
                        return Err(Error::ResourceNotFound {
                            resource_type: incoming.resource_type.clone(),
                            id: incoming.id.clone(),
                        });
                    }
                    if !options.allow_create {
                        return Err(Error::MethodNotAllowed(
                            "Resource creation is not allowed for this call".to_string(),
                        ));
                    }
                    let prepared = self.prepare(incoming.clone(), 1);
                    if with_backoff(|| self.try_insert(&prepared)).await? {
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Created,
                            key: prepared.key(),
                            last_updated: Some(prepared.last_updated),
                        });
                    }
                }
                Some(head) => {
                    if let Some(expected) = options.if_match {
                        if expected != head.version_id {
                            return Err(Error::VersionConflict {
                                expected,
                                actual: head.version_id,
                            });
                        }
                    }

                    if head.deleted && incoming.deleted {
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Updated,
                            key: ResourceKey::new(
                                incoming.resource_type.clone(),
                                incoming.id.clone(),
                            ),
                            last_updated: None,
                        });
                    }

                    let prepared = self.prepare(incoming.clone(), head.version_id + 1);
                    if with_backoff(|| {
                        self.try_replace(&prepared, head.row_version, options.keep_history)
                    })
                    .await?
                    {
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Updated,
                            key: prepared.key(),
                            last_updated: Some(prepared.last_updated),
                        });
                    }
                }
            }
        }
    }

    async fn get(&self, key: &ResourceKey) -> Result<Record> {
        let row = match key.version_id {
            Some(version_id) => sqlx::query(
                "SELECT resource_type, id, version_id, raw, last_updated, request_method,
                        deleted, meta_embedded, search_param_hash
                 FROM resources
                 WHERE resource_type = $1 AND id = $2 AND version_id = $3",
            )
            .bind(&key.resource_type)
            .bind(&key.id)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| {
                // Distinguish "no such version" from "no such resource".
                Error::VersionNotFound {
                    resource_type: key.resource_type.clone(),
                    id: key.id.clone(),
                    version_id,
                }
            })?,
            None => sqlx::query(
                "SELECT resource_type, id, version_id, raw, last_updated, request_method,
                        deleted, meta_embedded, search_param_hash
                 FROM resources
                 WHERE resource_type = $1 AND id = $2 AND is_current = TRUE",
            )
            .bind(&key.resource_type)
            .bind(&key.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            })?,
        };

        let mut record = Self::record_from_row(&row);
        if key.version_id.is_none() && record.deleted {
            return Err(Error::ResourceDeleted {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
                version_id: Some(record.version_id),
            });
        }

        record.index_rows = self
            .load_index_rows(&record.resource_type, &record.id, record.version_id)
            .await?;
        Ok(patch_meta_on_read(record))
    }

    async fn delete(&self, key: &ResourceKey, hard: bool) -> Result<Option<i32>> {
        if key.version_id.is_some() {
            return Err(Error::MethodNotAllowed(
                "Deleting a specific version is not allowed".to_string(),
            ));
        }

        if hard {
            let mut tx = self.pool.begin().await.map_err(classify)?;
            sqlx::query("DELETE FROM resources WHERE resource_type = $1 AND id = $2")
                .bind(&key.resource_type)
                .bind(&key.id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            sqlx::query("DELETE FROM search_index WHERE resource_type = $1 AND resource_id = $2")
                .bind(&key.resource_type)
                .bind(&key.id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            tx.commit().await.map_err(classify)?;
            return Ok(None);
        }

        loop {
            let Some(head) =
                with_backoff(|| self.read_head(&key.resource_type, &key.id)).await?
            else {
                return Ok(None);
            };
            if head.deleted {
                return Ok(None);
            }

            let mut tombstone = Record::new(
                key.resource_type.clone(),
                key.id.clone(),
                Vec::new(),
                RequestMethod::Delete,
            );
            tombstone.deleted = true;
            let tombstone = self.prepare(tombstone, head.version_id + 1);
            let new_version = tombstone.version_id;

            if with_backoff(|| self.try_replace(&tombstone, head.row_version, true)).await? {
                return Ok(Some(new_version));
            }
        }
    }

    async fn history(&self, resource_type: &str, id: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT resource_type, id, version_id, raw, last_updated, request_method,
                    deleted, meta_embedded, search_param_hash
             FROM resources
             WHERE resource_type = $1 AND id = $2
             ORDER BY version_id DESC",
        )
        .bind(resource_type)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .map(patch_meta_on_read)
            .collect())
    }

    async fn list_types(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT resource_type FROM resources WHERE is_current = TRUE
             ORDER BY resource_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(|r| r.get("resource_type")).collect())
    }

    async fn count_current(&self, resource_type: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM resources
             WHERE resource_type = $1 AND is_current = TRUE AND deleted = FALSE",
        )
        .bind(resource_type)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.get("count"))
    }

    async fn page_current(
        &self,
        resource_type: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT resource_type, id, version_id, raw, last_updated, request_method,
                    deleted, meta_embedded, search_param_hash
             FROM resources
             WHERE resource_type = $1 AND is_current = TRUE AND deleted = FALSE
               AND ($2::TEXT IS NULL OR id > $2)
             ORDER BY id ASC
             LIMIT $3",
        )
        .bind(resource_type)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        // Index rows are not hydrated here: the reindex path replaces them
        // wholesale.
        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .map(patch_meta_on_read)
            .collect())
    }
}

#[async_trait]
impl IndexWriter for PostgresResourceStore {
    async fn update_index(&self, record: &Record, if_match: i32) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        update_index_in_tx(&mut tx, record, if_match).await?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn update_indices_batch(&self, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for record in records {
            // Any precondition failure aborts the whole transaction.
            update_index_in_tx(&mut tx, record, record.version_id).await?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}

async fn update_index_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    record: &Record,
    if_match: i32,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE resources
         SET search_param_hash = $4, row_version = row_version + 1
         WHERE resource_type = $1 AND id = $2 AND is_current = TRUE
           AND deleted = FALSE AND version_id = $3",
    )
    .bind(&record.resource_type)
    .bind(&record.id)
    .bind(if_match)
    .bind(&record.search_param_hash)
    .execute(&mut **tx)
    .await
    .map_err(classify)?;

    if updated.rows_affected() == 0 {
        let head = sqlx::query(
            "SELECT version_id FROM resources
             WHERE resource_type = $1 AND id = $2 AND is_current = TRUE AND deleted = FALSE",
        )
        .bind(&record.resource_type)
        .bind(&record.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;

        return Err(match head {
            Some(row) => Error::VersionConflict {
                expected: if_match,
                actual: row.get("version_id"),
            },
            None => Error::ResourceNotFound {
                resource_type: record.resource_type.clone(),
                id: record.id.clone(),
            },
        });
    }

    PostgresResourceStore::replace_index_rows(
        tx,
        &record.resource_type,
        &record.id,
        record.version_id,
        &record.index_rows,
    )
    .await
    .map_err(classify)?;

    Ok(())
}

/// Translate backend errors into the contract taxonomy. Backend-specific
/// codes never cross the trait boundary.
fn classify(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            return match code.as_ref() {
                // too_many_connections / configuration_limit_exceeded
                "53300" | "53400" => Error::RateLimited(db.message().to_string()),
                // cannot_connect_now / admin_shutdown / crash_shutdown
                "57P03" | "57P01" | "57P02" => Error::Unavailable(db.message().to_string()),
                _ => Error::Database(e),
            };
        }
    }
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Error::Unavailable(e.to_string()),
        _ => Error::Database(e),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Retry transient backend pressure with exponential backoff before
/// surfacing. Precondition failures pass through untouched.
async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = std::time::Duration::from_millis(50);
    let mut attempts = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempts < 4 => {
                attempts += 1;
                tracing::debug!(error = %e, attempt = attempts, "Retrying storage call");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
