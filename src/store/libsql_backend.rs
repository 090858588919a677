//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Jobs are stored with a JSON
//! payload column so the job shape can evolve without schema churn.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{ForwardJob, JobStatus};
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL persistence backend.
///
/// Holds a single connection reused for all operations. `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Store opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Delivered => "delivered",
        JobStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> JobStatus {
    match s {
        "delivered" => JobStatus::Delivered,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

fn row_to_job(row: &libsql::Row) -> Result<ForwardJob, StoreError> {
    let payload: String = row
        .get(0)
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let attempts: i64 = row
        .get(1)
        .map_err(|e| StoreError::Query(e.to_string()))?;

    let mut job: ForwardJob = serde_json::from_str(&payload)
        .map_err(|e| StoreError::Serialization(format!("Bad job payload: {e}")))?;
    // The attempts column is authoritative; the payload copy is write-time only.
    job.attempts = attempts.max(0) as u32;
    Ok(job)
}

#[async_trait]
impl Store for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(
                row.get(0).map_err(|e| StoreError::Query(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_job(&self, job: &ForwardJob) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO forward_jobs (id, payload, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                params![job.id.to_string(), payload, i64::from(job.attempts), now],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn record_job_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE forward_jobs SET attempts = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    i64::from(attempts),
                    error,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn mark_job(
        &self,
        id: Uuid,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE forward_jobs SET status = ?2, last_error = COALESCE(?3, last_error),
                 updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    status_to_str(status),
                    last_error,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<ForwardJob>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload, attempts FROM forward_jobs
                 WHERE status = 'pending' ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn job_status(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM forward_jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            Some(row) => {
                let status: String =
                    row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(Some(str_to_status(&status)))
            }
            None => Ok(None),
        }
    }
}
