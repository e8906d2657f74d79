//! Notification Seam
//!
//! The lifecycle publishes "request updated" events through the `Notifier`
//! trait and never depends on a concrete delivery mechanism. Delivery is
//! best-effort and fire-and-forget relative to state transitions: a
//! transition commits first and is never rolled back when delivery fails.
//!
//! `NotificationQueue` decouples delivery onto a background task with
//! bounded retries and backoff; exhausted notifications are logged and
//! dropped. Delivery fan-out (push, messaging, broadcast) is an external
//! collaborator behind the sink trait.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery attempts per notification before it is dropped.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Backoff between delivery attempts.
const RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalPending,
    StatusChanged,
    TrustAdjusted,
    PassExpired,
    GateEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub request_id: Option<Uuid>,
    pub body: String,
}

impl Notification {
    pub fn new(
        recipient: Uuid,
        kind: NotificationKind,
        request_id: Option<Uuid>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            kind,
            request_id,
            body: body.into(),
        }
    }
}

/// Publish-subscribe seam between the lifecycle and delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Log-only sink, used by the server binary and the test suite.
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn publish(&self, n: Notification) -> anyhow::Result<()> {
        debug!(
            recipient = %n.recipient,
            kind = ?n.kind,
            request_id = ?n.request_id,
            "notification: {}",
            n.body
        );
        Ok(())
    }
}

/// Best-effort async queue in front of a sink. `publish` only enqueues and
/// cannot fail the caller's transition.
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationQueue {
    /// Spawn the drain task and return the queue handle.
    pub fn spawn(sink: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                deliver_with_retry(sink.as_ref(), n).await;
            }
        });
        Self { tx }
    }
}

async fn deliver_with_retry(sink: &dyn Notifier, n: Notification) {
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match sink.publish(n.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
                warn!(
                    recipient = %n.recipient,
                    attempt,
                    error = %e,
                    "notification delivery failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
            }
            Err(e) => {
                warn!(
                    recipient = %n.recipient,
                    error = %e,
                    "notification dropped after {} attempts",
                    MAX_DELIVERY_ATTEMPTS
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for NotificationQueue {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        // Receiver only closes at shutdown; a failed send is not worth
        // surfacing to the transition that triggered it.
        let _ = self.tx.send(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        failures_left: AtomicU32,
        delivered: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakySink {
        async fn publish(&self, _n: Notification) -> anyhow::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("transient failure");
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_retries_transient_failures() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            delivered: AtomicU32::new(0),
        });
        let queue = NotificationQueue::spawn(sink.clone());
        queue
            .publish(Notification::new(
                Uuid::new_v4(),
                NotificationKind::StatusChanged,
                None,
                "pass approved",
            ))
            .await
            .unwrap();

        // Paused clock: yield until the drain task has burned both retries.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            if sink.delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
        }
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }
}
