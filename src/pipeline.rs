//! Pipeline assembly and the restart hook.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::control::RunControl;
use crate::dispatch::MailDispatcher;
use crate::error::Result;
use crate::events::LogBus;
use crate::inbox::MessageInbox;
use crate::queue::{ForwardQueue, JobSink, RetryPolicy};
use crate::scanner::MessageScanner;
use crate::store::Store;
use crate::triggers::{self, ObserverHandle, PushTrigger};

/// The fully wired forwarder: scanner, queue, triggers and run control.
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub events: LogBus,
    pub scanner: Arc<MessageScanner>,
    pub queue: ForwardQueue,
    pub control: RunControl,
    pub push: Arc<PushTrigger>,
    pub observer: ObserverHandle,
    worker: JoinHandle<()>,
    observer_task: JoinHandle<()>,
}

impl Pipeline {
    /// Wire everything together and spawn the queue worker and observer.
    pub fn build(
        store: Arc<dyn Store>,
        inbox: Arc<dyn MessageInbox>,
        dispatcher: Arc<dyn MailDispatcher>,
        events: LogBus,
        retry: RetryPolicy,
    ) -> Self {
        let (queue, worker) = ForwardQueue::start(
            Arc::clone(&store),
            dispatcher,
            events.clone(),
            retry,
        );

        let scanner = Arc::new(MessageScanner::new(
            Arc::clone(&store),
            inbox,
            Arc::new(queue.clone()) as Arc<dyn JobSink>,
            events.clone(),
        ));

        let control = RunControl::new(Arc::clone(&store), events.clone());
        let push = Arc::new(PushTrigger::new(
            Arc::clone(&scanner),
            Arc::clone(&store),
            events.clone(),
        ));
        let (observer, observer_task) = triggers::spawn_change_observer(
            Arc::clone(&scanner),
            Arc::clone(&store),
            events.clone(),
        );

        Self {
            store,
            events,
            scanner,
            queue,
            control,
            push,
            observer,
            worker,
            observer_task,
        }
    }

    /// Restart hook: if the persisted run flag is still on, re-verify inbox
    /// access, re-schedule pending jobs and pick up scanning where the last
    /// process life stopped. Returns whether the pipeline was resumed.
    pub async fn resume_if_running(&self) -> Result<bool> {
        use crate::control::RunStatus;

        if self.control.status().await? != RunStatus::Running {
            tracing::info!("Run flag is off, not resuming");
            return Ok(false);
        }

        tracing::info!("Run flag is on, resuming forwarding");
        self.scanner.verify_access().await?;
        let resumed = self.queue.resume().await?;
        if resumed > 0 {
            self.events
                .publish(format!("Resumed {resumed} pending email job(s)"));
        }
        self.events.publish("→ Service running, waiting for SMS...");
        Ok(true)
    }

    /// Spawn the inbox watcher that feeds the change observer.
    pub fn spawn_watcher(
        &self,
        inbox: Arc<dyn MessageInbox>,
        interval: Duration,
    ) -> JoinHandle<()> {
        triggers::spawn_inbox_watcher(inbox, self.observer.clone(), interval)
    }

    /// Tear down the background tasks. Pending queue work is left persisted
    /// for the next `resume_if_running()`.
    pub fn shutdown(self) {
        self.observer_task.abort();
        self.worker.abort();
    }
}
