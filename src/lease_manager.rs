//! Subscriber-side lease mirror.
//!
//! The broker's `leases` map is authoritative; this registry exists
//! alongside it to drive periodic deadline-extension requests from the
//! consumer side: a `flush`/`extend` periodic loop keyed by ackId. Here
//! "extending" is just calling back into the in-process broker instead of
//! issuing a `ModifyAckDeadline` RPC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::broker::MessageQueue;

/// Extension is capped per-call at `max_ack_deadline` and cumulatively at
/// `max_extension_time`.
#[derive(Clone, Copy, Debug)]
pub struct LeaseManagerConfig {
    pub max_ack_deadline: Duration,
    pub max_extension_time: Duration,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            max_ack_deadline: Duration::from_secs(600),
            max_extension_time: Duration::from_secs(3600),
        }
    }
}

struct Tracked {
    task: JoinHandle<()>,
}

struct Inner {
    broker: MessageQueue,
    subscription: String,
    ack_deadline: Duration,
    config: LeaseManagerConfig,
    tracked: Mutex<HashMap<String, Tracked>>,
}

/// Keeps a subscription's pulled-but-unresolved messages alive by
/// periodically re-extending their broker-side lease.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new(
        broker: MessageQueue,
        subscription: impl Into<String>,
        ack_deadline: Duration,
        config: LeaseManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                subscription: subscription.into(),
                ack_deadline,
                config,
                tracked: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Arms a periodic deadline extender for `ack_id`, renewing at half the
    /// ack deadline until `max_extension_time` has elapsed since the lease
    /// was first added, at which point it stops (letting the underlying
    /// lease expire on its own broker-side timer if still unresolved).
    pub fn add_lease(&self, ack_id: impl Into<String>) {
        let ack_id = ack_id.into();
        let manager = self.inner.clone();
        let renew_interval = (self.inner.ack_deadline / 2).max(Duration::from_millis(1));
        let added_at = Instant::now();
        let task_ack_id = ack_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(renew_interval).await;
                if added_at.elapsed() >= manager.config.max_extension_time {
                    break;
                }
                let extension = manager.ack_deadline.min(manager.config.max_ack_deadline);
                let result = manager
                    .broker
                    .modify_ack_deadline(&task_ack_id, extension.as_secs() as u16);
                if result.is_err() {
                    // The message was already ack'd, nack'd, or its
                    // subscription is gone; nothing left to extend.
                    break;
                }
            }
        });
        let previous = self.inner.tracked.lock().insert(ack_id, Tracked { task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    pub fn extend_deadline(&self, ack_id: &str, seconds: u16) {
        let seconds = seconds.min(self.inner.config.max_ack_deadline.as_secs() as u16);
        let _ = self.inner.broker.modify_ack_deadline(ack_id, seconds);
    }

    pub fn remove_lease(&self, ack_id: &str) {
        if let Some(tracked) = self.inner.tracked.lock().remove(ack_id) {
            tracked.task.abort();
        }
    }

    pub fn clear(&self) {
        for (_, tracked) in self.inner.tracked.lock().drain() {
            tracked.task.abort();
        }
    }

    pub fn subscription(&self) -> &str {
        &self.inner.subscription
    }

    pub fn len(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PublishMessage;

    #[tokio::test(start_paused = true)]
    async fn extends_lease_past_its_original_deadline() {
        let broker = MessageQueue::new();
        broker.register_topic("t", None).unwrap();
        broker.register_subscription("s", "t", None).unwrap();
        broker.publish("t", vec![PublishMessage::new("x")]).unwrap();
        let (ack_id, _) = broker.pull("s", 1).unwrap().pop().unwrap();

        let manager = LeaseManager::new(broker.clone(), "s", Duration::from_secs(2), LeaseManagerConfig::default());
        manager.add_lease(ack_id.clone());

        // Past the original 2s deadline; the manager should have renewed it.
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(broker.ack(&ack_id).is_ok());
        manager.remove_lease(&ack_id);
    }

    #[tokio::test]
    async fn remove_lease_stops_tracking() {
        let broker = MessageQueue::new();
        let manager = LeaseManager::new(broker, "s", Duration::from_secs(10), LeaseManagerConfig::default());
        manager.add_lease("a1");
        assert_eq!(manager.len(), 1);
        manager.remove_lease("a1");
        assert_eq!(manager.len(), 0);
    }
}
