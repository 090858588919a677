//! Durable forward queue.
//!
//! `enqueue()` persists the job and returns; a single worker task executes
//! jobs one at a time (one in-flight send per mail account) with bounded
//! exponential-backoff retry. Jobs accepted before a crash are re-scheduled
//! by `resume()`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ForwarderConfig;
use crate::dispatch::MailDispatcher;
use crate::error::QueueError;
use crate::events::{LogBus, stamp};
use crate::inbox::SmsMessage;
use crate::store::{Store, keys};

/// One unit of work: deliver a single message by mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardJob {
    pub id: Uuid,
    pub sender: String,
    pub body: String,
    /// Message receive time, epoch millis.
    pub timestamp: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Failed dispatch attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl ForwardJob {
    pub fn new(sender: &str, body: &str, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn from_message(message: &SmsMessage) -> Self {
        Self::new(&message.sender, &message.body, message.timestamp)
    }
}

/// Persisted job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Delivered,
    Failed,
}

/// Bounded exponential backoff for transient dispatch failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total dispatch attempts before a job is permanently failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failures so far.
    /// Doubles each time: base, 2*base, 4*base, ...
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(failures.saturating_sub(1))
    }
}

/// Where the scanner hands detected messages. Implemented by `ForwardQueue`;
/// tests substitute a recorder.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue(&self, job: ForwardJob) -> Result<(), QueueError>;
}

/// Handle to the durable forward queue.
#[derive(Clone)]
pub struct ForwardQueue {
    tx: mpsc::UnboundedSender<ForwardJob>,
    store: Arc<dyn Store>,
    events: LogBus,
}

impl ForwardQueue {
    /// Spawn the worker and return the queue handle.
    pub fn start(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn MailDispatcher>,
        events: LogBus,
        retry: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            rx,
            Arc::clone(&store),
            dispatcher,
            events.clone(),
            retry,
        ));
        (Self { tx, store, events }, worker)
    }

    /// Re-schedule jobs that were accepted but not terminal when the process
    /// last stopped. Returns how many were re-scheduled.
    pub async fn resume(&self) -> Result<usize, QueueError> {
        let pending = self.store.pending_jobs().await?;
        let count = pending.len();
        for job in pending {
            tracing::info!(job_id = %job.id, attempts = job.attempts, "Resuming pending job");
            self.tx.send(job).map_err(|_| QueueError::Closed)?;
        }
        Ok(count)
    }
}

#[async_trait]
impl JobSink for ForwardQueue {
    /// Durable accept: the job row is persisted before this returns, so a
    /// crash after enqueue cannot lose it. The send itself happens on the
    /// worker.
    async fn enqueue(&self, job: ForwardJob) -> Result<(), QueueError> {
        self.store.insert_job(&job).await?;
        self.store
            .trace(
                keys::LAST_EMAIL_ENQUEUED,
                &format!("For {} at {}", job.sender, stamp()),
            )
            .await;
        self.events.publish("   Email work enqueued...");
        self.tx.send(job).map_err(|_| QueueError::Closed)?;
        Ok(())
    }
}

/// Worker loop: executes jobs sequentially until all queue handles drop.
async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<ForwardJob>,
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn MailDispatcher>,
    events: LogBus,
    retry: RetryPolicy,
) {
    while let Some(job) = rx.recv().await {
        execute_job(job, &store, dispatcher.as_ref(), &events, retry).await;
    }
    tracing::debug!("Forward queue worker stopped");
}

/// Run one job to a terminal outcome (delivered or permanently failed).
async fn execute_job(
    mut job: ForwardJob,
    store: &Arc<dyn Store>,
    dispatcher: &dyn MailDispatcher,
    events: &LogBus,
    retry: RetryPolicy,
) {
    loop {
        let config = match ForwarderConfig::load(store).await {
            Ok(config) => config,
            Err(e) => {
                // Settings store unreachable: leave the job pending so a
                // restart resume can pick it up.
                tracing::error!(job_id = %job.id, error = %e, "Cannot load mail settings");
                events.publish(format!("❌ MAIL_FAILED: {e}"));
                return;
            }
        };

        events.publish(format!(
            "   Connecting to {}:{}",
            config.smtp_host, config.smtp_port
        ));

        match dispatcher.send(&job, &config).await {
            Ok(()) => {
                if let Err(e) = store.mark_job(job.id, JobStatus::Delivered, None).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to mark job delivered");
                }
                events.publish(format!("✅ MAIL_SENT to {}", config.target_email));
                events.publish("→ Waiting for message...");
                return;
            }
            Err(e) if !e.is_retryable() => {
                tracing::error!(job_id = %job.id, error = %e, "Job failed, not retryable");
                store
                    .trace(keys::LAST_ERROR, &format!("{e} at {}", stamp()))
                    .await;
                if let Err(mark) = store
                    .mark_job(job.id, JobStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(job_id = %job.id, error = %mark, "Failed to mark job failed");
                }
                events.publish(format!("❌ MAIL_FAILED: {e}"));
                events.publish("→ Waiting for message...");
                return;
            }
            Err(e) => {
                job.attempts += 1;
                if let Err(rec) = store
                    .record_job_attempt(job.id, job.attempts, &e.to_string())
                    .await
                {
                    tracing::warn!(job_id = %job.id, error = %rec, "Failed to record attempt");
                }

                if job.attempts >= retry.max_attempts {
                    tracing::error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "Retries exhausted, job permanently failed"
                    );
                    store
                        .trace(keys::LAST_ERROR, &format!("{e} at {}", stamp()))
                        .await;
                    if let Err(mark) = store
                        .mark_job(job.id, JobStatus::Failed, Some(&e.to_string()))
                        .await
                    {
                        tracing::warn!(job_id = %job.id, error = %mark, "Failed to mark job failed");
                    }
                    events.publish(format!("❌ MAIL_FAILED: {e}"));
                    events.publish("→ Waiting for message...");
                    return;
                }

                let delay = retry.delay_after(job.attempts);
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Dispatch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::DispatchError;
    use crate::store::LibSqlStore;

    /// Dispatcher that replays a programmed sequence of outcomes.
    struct ScriptedDispatcher {
        script: Mutex<VecDeque<Result<(), DispatchError>>>,
        sends: AtomicUsize,
    }

    impl ScriptedDispatcher {
        fn new(script: Vec<Result<(), DispatchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                sends: AtomicUsize::new(0),
            }
        }

        fn successful_sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailDispatcher for ScriptedDispatcher {
        async fn send(
            &self,
            _job: &ForwardJob,
            _config: &ForwarderConfig,
        ) -> Result<(), DispatchError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(DispatchError::Unknown("script exhausted".into())));
            if outcome.is_ok() {
                self.sends.fetch_add(1, Ordering::SeqCst);
            }
            outcome
        }
    }

    async fn configured_store() -> Arc<dyn Store> {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.set(keys::TARGET_EMAIL, "to@example.com").await.unwrap();
        store.set(keys::USERNAME, "me@gmail.com").await.unwrap();
        store.set(keys::PASSWORD, "secret").await.unwrap();
        Arc::new(store)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    async fn wait_terminal(store: &Arc<dyn Store>, id: Uuid) -> JobStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match store.job_status(id).await.unwrap() {
                    Some(status) if status != JobStatus::Pending => return status,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("job never reached a terminal state")
    }

    #[tokio::test]
    async fn delivers_on_first_attempt() {
        let store = configured_store().await;
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![Ok(())]));
        let (queue, _worker) =
            ForwardQueue::start(Arc::clone(&store), dispatcher.clone(), LogBus::default(), fast_retry());

        let job = ForwardJob::new("+15551234", "hi", 0);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        assert_eq!(wait_terminal(&store, id).await, JobStatus::Delivered);
        assert_eq!(dispatcher.successful_sends(), 1);
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_sends_exactly_once() {
        let store = configured_store().await;
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            Err(DispatchError::Connection("refused".into())),
            Err(DispatchError::Connection("refused".into())),
            Ok(()),
        ]));
        let (queue, _worker) =
            ForwardQueue::start(Arc::clone(&store), dispatcher.clone(), LogBus::default(), fast_retry());

        let job = ForwardJob::new("+15551234", "hi", 0);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        assert_eq!(wait_terminal(&store, id).await, JobStatus::Delivered);
        assert_eq!(dispatcher.successful_sends(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_permanently() {
        let store = configured_store().await;
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            Err(DispatchError::Connection("down".into())),
            Err(DispatchError::Auth("535".into())),
            Err(DispatchError::Connection("down".into())),
            // A fourth outcome would be a bug: the cap is 3 attempts.
            Ok(()),
        ]));
        let (queue, _worker) =
            ForwardQueue::start(Arc::clone(&store), dispatcher.clone(), LogBus::default(), fast_retry());

        let job = ForwardJob::new("+15551234", "hi", 0);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        assert_eq!(wait_terminal(&store, id).await, JobStatus::Failed);
        assert_eq!(dispatcher.successful_sends(), 0);
        // last_error trace was recorded.
        assert!(store.get(keys::LAST_ERROR).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn incomplete_config_fails_without_retry() {
        let store = configured_store().await;
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            Err(DispatchError::IncompleteConfig("password".into())),
            Ok(()),
        ]));
        let (queue, _worker) =
            ForwardQueue::start(Arc::clone(&store), dispatcher.clone(), LogBus::default(), fast_retry());

        let job = ForwardJob::new("+15551234", "hi", 0);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        assert_eq!(wait_terminal(&store, id).await, JobStatus::Failed);
        // The scripted Ok was never consumed: no retry happened.
        assert_eq!(dispatcher.successful_sends(), 0);
        assert!(store.get(keys::LAST_ERROR).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resume_reschedules_persisted_pending_jobs() {
        let store = configured_store().await;

        // Job accepted by a previous process life: row exists, no worker saw it.
        let job = ForwardJob::new("+15551234", "from before the crash", 0);
        let id = job.id;
        store.insert_job(&job).await.unwrap();

        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![Ok(())]));
        let (queue, _worker) =
            ForwardQueue::start(Arc::clone(&store), dispatcher.clone(), LogBus::default(), fast_retry());

        assert_eq!(queue.resume().await.unwrap(), 1);
        assert_eq!(wait_terminal(&store, id).await, JobStatus::Delivered);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        };
        assert_eq!(retry.delay_after(1), Duration::from_secs(5));
        assert_eq!(retry.delay_after(2), Duration::from_secs(10));
        assert_eq!(retry.delay_after(3), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn enqueue_is_durable_before_dispatch() {
        let store = configured_store().await;
        // Dispatcher that never completes, so the job stays in flight.
        struct StuckDispatcher;
        #[async_trait]
        impl MailDispatcher for StuckDispatcher {
            async fn send(
                &self,
                _job: &ForwardJob,
                _config: &ForwarderConfig,
            ) -> Result<(), DispatchError> {
                std::future::pending().await
            }
        }

        let (queue, _worker) = ForwardQueue::start(
            Arc::clone(&store),
            Arc::new(StuckDispatcher),
            LogBus::default(),
            fast_retry(),
        );

        let job = ForwardJob::new("+15551234", "hi", 0);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        assert_eq!(store.job_status(id).await.unwrap(), Some(JobStatus::Pending));
        assert!(store.get(keys::LAST_EMAIL_ENQUEUED).await.unwrap().is_some());
    }
}
