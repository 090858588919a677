//! Trigger sources — the two independent producers that request scans.
//!
//! A push trigger fires once per newly arrived message and carries the
//! payload; a change observer fires on any store change with no payload.
//! Both end up in `MessageScanner::check()`, which owns the run-flag gate
//! and the critical section, so neither trigger duplicates them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::events::{LogBus, stamp};
use crate::inbox::{InboxQuery, MessageInbox, SmsMessage};
use crate::scanner::{MessageScanner, ScanOutcome};
use crate::store::{Store, keys};

/// Per-message push notification entry point.
///
/// The payload is deliberately not trusted: the inbox is re-queried via
/// `check()` so the cursor stays the single source of truth and a duplicate
/// or stale push cannot double-forward.
pub struct PushTrigger {
    scanner: Arc<MessageScanner>,
    store: Arc<dyn Store>,
    events: LogBus,
}

impl PushTrigger {
    pub fn new(scanner: Arc<MessageScanner>, store: Arc<dyn Store>, events: LogBus) -> Self {
        Self {
            scanner,
            store,
            events,
        }
    }

    /// Handle one delivered message event.
    pub async fn deliver(&self, message: &SmsMessage) -> Result<ScanOutcome> {
        self.store
            .trace(keys::LAST_RECEIVER_CALL, &format!("Push at {}", stamp()))
            .await;
        tracing::debug!(id = message.id, sender = %message.sender, "Push trigger");
        self.events.publish("→ SMS_PUSH_RECEIVED");
        self.scanner.check().await
    }
}

/// Consume a stream of pushed messages until the sender side closes.
pub fn spawn_push_listener(
    trigger: Arc<PushTrigger>,
    mut rx: mpsc::Receiver<SmsMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = trigger.deliver(&message).await {
                tracing::error!(error = %e, "Push-triggered scan failed");
            }
        }
        tracing::debug!("Push listener stopped");
    })
}

/// Handle used to signal "the message store changed".
///
/// Backed by `tokio::sync::Notify`; racing notifications coalesce, which is
/// fine given the scanner forwards only the newest unseen message anyway.
#[derive(Clone)]
pub struct ObserverHandle {
    notify: Arc<Notify>,
}

impl ObserverHandle {
    pub fn notify_change(&self) {
        self.notify.notify_one();
    }
}

/// Spawn the change observer: every notification runs one `check()`.
pub fn spawn_change_observer(
    scanner: Arc<MessageScanner>,
    store: Arc<dyn Store>,
    events: LogBus,
) -> (ObserverHandle, JoinHandle<()>) {
    let notify = Arc::new(Notify::new());
    let handle = ObserverHandle {
        notify: Arc::clone(&notify),
    };

    let task = tokio::spawn(async move {
        store
            .trace(keys::OBSERVER_STATUS, &format!("Registered at {}", stamp()))
            .await;
        events.publish("✅ Observer registered");

        loop {
            notify.notified().await;
            store
                .trace(
                    keys::LAST_OBSERVER_TRIGGER,
                    &format!("Change at {}", stamp()),
                )
                .await;
            events.publish("→ SMS_CONTENT_CHANGED");
            if let Err(e) = scanner.check().await {
                tracing::error!(error = %e, "Observer-triggered scan failed");
            }
        }
    });

    (handle, task)
}

/// Poll the inbox for its newest id and fire the observer when it changes.
///
/// Stands in for a native store-change notification: any insert, update or
/// delete that moves the newest id triggers a scan. The scan itself decides
/// whether anything is actually new.
pub fn spawn_inbox_watcher(
    inbox: Arc<dyn MessageInbox>,
    handle: ObserverHandle,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen: Option<i64> = None;

        loop {
            tick.tick().await;
            let newest = match inbox
                .query(InboxQuery {
                    min_id_exclusive: 0,
                    limit: Some(1),
                })
                .await
            {
                Ok(batch) => batch.first().map(|m| m.id),
                Err(e) => {
                    tracing::warn!(error = %e, "Inbox watcher query failed");
                    continue;
                }
            };

            if newest != last_seen {
                last_seen = newest;
                handle.notify_change();
            }
        }
    })
}
