//! Run control — the persisted on/off switch gating the pipeline.
//!
//! Stopped is the initial state. Starting validates the mail settings first;
//! stopping only flips the flag — in-flight forward jobs run to completion.
//! Failures while running (revoked access, mail errors) never flip the flag
//! back; the pipeline keeps trying and logging.

use std::sync::Arc;

use crate::config::ForwarderConfig;
use crate::error::{ConfigError, Result};
use crate::events::{LogBus, stamp};
use crate::store::{Store, keys};

/// Pipeline run state, derived from the persisted flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Stopped,
    Running,
}

#[derive(Clone)]
pub struct RunControl {
    store: Arc<dyn Store>,
    events: LogBus,
}

impl RunControl {
    pub fn new(store: Arc<dyn Store>, events: LogBus) -> Self {
        Self { store, events }
    }

    pub async fn status(&self) -> Result<RunStatus> {
        Ok(if self.store.get_flag(keys::IS_RUNNING).await? {
            RunStatus::Running
        } else {
            RunStatus::Stopped
        })
    }

    /// Stopped → Running. Refuses to start with incomplete mail settings.
    pub async fn start(&self) -> Result<()> {
        let config = ForwarderConfig::load(&self.store).await?;
        let missing = config.missing_fields();
        if !missing.is_empty() {
            self.events.publish("❌ Credentials not configured");
            return Err(ConfigError::MissingRequired(missing.join(", ")).into());
        }

        self.store.set_flag(keys::IS_RUNNING, true).await?;
        self.store
            .trace(keys::SERVICE_STATUS, &format!("Started at {}", stamp()))
            .await;
        self.events.publish("✅ Credentials validated");
        self.events.publish("→ Starting SMS observer service...");
        tracing::info!("Forwarding started");
        Ok(())
    }

    /// Running → Stopped. In-flight jobs are not cancelled.
    pub async fn stop(&self) -> Result<()> {
        self.store.set_flag(keys::IS_RUNNING, false).await?;
        self.store
            .trace(keys::SERVICE_STATUS, &format!("Stopped at {}", stamp()))
            .await;
        self.events.publish("Service stopped");
        tracing::info!("Forwarding stopped");
        Ok(())
    }
}
