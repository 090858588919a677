//! Unified `Store` trait — single async interface for all persistence.
//!
//! Covers the key/value settings store (run flag, mail settings, cursor,
//! debug trace) and the durable forward-job table. Single-key reads and
//! writes are atomic; nothing here needs a multi-key transaction.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{ForwardJob, JobStatus};

/// Well-known settings keys.
pub mod keys {
    /// Run flag gating the whole pipeline.
    pub const IS_RUNNING: &str = "is_running";

    // Mail settings.
    pub const TARGET_EMAIL: &str = "target_email";
    pub const SMTP_HOST: &str = "smtp_host";
    pub const SMTP_PORT: &str = "smtp_port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";

    /// Highest message id already handed to the forward queue.
    pub const LAST_SMS_ID: &str = "last_sms_id";

    // Diagnostic trace keys. Best-effort, never load-bearing.
    pub const LAST_RECEIVER_CALL: &str = "last_receiver_call";
    pub const LAST_SMS_DETECTED: &str = "last_sms_detected";
    pub const LAST_EMAIL_ENQUEUED: &str = "last_email_enqueued";
    pub const LAST_ERROR: &str = "last_error";
    pub const SERVICE_STATUS: &str = "service_status";
    pub const SMS_ACCESS_TEST: &str = "sms_access_test";
    pub const OBSERVER_STATUS: &str = "observer_status";
    pub const LAST_OBSERVER_TRIGGER: &str = "last_observer_trigger";
}

/// Backend-agnostic persistence trait covering settings and forward jobs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a settings value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a settings value (upsert).
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // ── Forward jobs ────────────────────────────────────────────────

    /// Persist a newly accepted job (status `Pending`).
    async fn insert_job(&self, job: &ForwardJob) -> Result<(), StoreError>;

    /// Record a failed attempt against a pending job.
    async fn record_job_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Move a job to a terminal (or back to pending) status.
    async fn mark_job(
        &self,
        id: Uuid,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// All jobs still pending, oldest first. Used to resume after restart.
    async fn pending_jobs(&self) -> Result<Vec<ForwardJob>, StoreError>;

    /// Current status of one job, if it exists.
    async fn job_status(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError>;

    // ── Typed helpers ───────────────────────────────────────────────

    async fn get_flag(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.as_deref() == Some("true"))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set(key, if value { "true" } else { "false" }).await
    }

    /// Current cursor value; 0 if never written.
    async fn cursor(&self) -> Result<i64, StoreError> {
        Ok(self
            .get(keys::LAST_SMS_ID)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn set_cursor(&self, id: i64) -> Result<(), StoreError> {
        self.set(keys::LAST_SMS_ID, &id.to_string()).await
    }

    /// Whether the cursor key has ever been written.
    async fn has_cursor(&self) -> Result<bool, StoreError> {
        Ok(self.get(keys::LAST_SMS_ID).await?.is_some())
    }

    /// Best-effort diagnostic write. Failures are logged and swallowed so a
    /// broken trace never takes down the pipeline.
    async fn trace(&self, key: &str, value: &str) {
        if let Err(e) = self.set(key, value).await {
            tracing::warn!(key, error = %e, "Failed to record debug trace");
        }
    }
}
