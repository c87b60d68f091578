//! Batched ack/nack/modAck aggregator.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::broker::MessageQueue;
use crate::error::Status;

/// Defaults: 3000 messages, 100 ms.
#[derive(Clone, Copy, Debug)]
pub struct AckManagerConfig {
    pub max_messages: usize,
    pub max_millis: u64,
}

impl Default for AckManagerConfig {
    fn default() -> Self {
        Self { max_messages: 3000, max_millis: 100 }
    }
}

enum AckOp {
    Ack(String),
    Nack(String),
    ModifyAckDeadline(String, u16),
}

struct Pending {
    op: AckOp,
    done: oneshot::Sender<Result<(), Status>>,
}

#[derive(Default)]
struct Batch {
    pending: Vec<Pending>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    broker: MessageQueue,
    config: Mutex<AckManagerConfig>,
    batch: Mutex<Batch>,
    closed: Mutex<bool>,
}

/// Collects ack/nack/modAck calls from a subscription and flushes them as a
/// group on a count or time trigger.
#[derive(Clone)]
pub struct AckManager {
    inner: Arc<Inner>,
}

impl AckManager {
    pub fn new(broker: MessageQueue, config: AckManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                config: Mutex::new(config),
                batch: Mutex::new(Batch::default()),
                closed: Mutex::new(false),
            }),
        }
    }

    pub async fn ack(&self, ack_id: impl Into<String>) -> Result<(), Status> {
        self.enqueue(AckOp::Ack(ack_id.into())).await
    }

    pub async fn nack(&self, ack_id: impl Into<String>) -> Result<(), Status> {
        self.enqueue(AckOp::Nack(ack_id.into())).await
    }

    pub async fn modify_ack_deadline(&self, ack_id: impl Into<String>, seconds: u16) -> Result<(), Status> {
        self.enqueue(AckOp::ModifyAckDeadline(ack_id.into(), seconds)).await
    }

    async fn enqueue(&self, op: AckOp) -> Result<(), Status> {
        if *self.inner.closed.lock() {
            return Err(Status::cancelled("ack manager is closed"));
        }
        let (tx, rx) = oneshot::channel();
        let should_flush = {
            let max_messages = self.inner.config.lock().max_messages;
            let mut batch = self.inner.batch.lock();
            batch.pending.push(Pending { op, done: tx });
            if batch.timer.is_none() {
                batch.timer = Some(self.arm_timer());
            }
            batch.pending.len() >= max_messages
        };
        if should_flush {
            self.flush();
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Status::cancelled("ack manager shut down before this batch flushed")),
        }
    }

    fn arm_timer(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let max_millis = self.inner.config.lock().max_millis;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(max_millis)).await;
            manager.flush();
        })
    }

    /// Runs every pending op in order; the first broker error rejects itself
    /// and every op still queued behind it with that same error.
    pub fn flush(&self) {
        let pending = {
            let mut batch = self.inner.batch.lock();
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut batch.pending)
        };
        if pending.is_empty() {
            return;
        }

        let mut iter = pending.into_iter();
        while let Some(entry) = iter.next() {
            let result = match &entry.op {
                AckOp::Ack(id) => self.inner.broker.ack(id),
                AckOp::Nack(id) => self.inner.broker.nack(id),
                AckOp::ModifyAckDeadline(id, seconds) => self.inner.broker.modify_ack_deadline(id, *seconds),
            };
            match result {
                Ok(()) => {
                    let _ = entry.done.send(Ok(()));
                }
                Err(status) => {
                    let _ = entry.done.send(Err(status.clone()));
                    for remaining in iter.by_ref() {
                        let _ = remaining.done.send(Err(status.clone()));
                    }
                    break;
                }
            }
        }
    }

    /// Flushes anything pending and stops accepting new calls.
    pub fn close(&self) {
        self.flush();
        *self.inner.closed.lock() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PublishMessage;

    fn setup() -> (MessageQueue, String) {
        let broker = MessageQueue::new();
        broker.register_topic("t", None).unwrap();
        broker.register_subscription("s", "t", None).unwrap();
        broker.publish("t", vec![PublishMessage::new("x")]).unwrap();
        let (ack_id, _) = broker.pull("s", 1).unwrap().pop().unwrap();
        (broker, ack_id)
    }

    #[tokio::test]
    async fn count_trigger_flushes_and_resolves() {
        let (broker, ack_id) = setup();
        let manager = AckManager::new(broker, AckManagerConfig { max_messages: 1, max_millis: 10_000 });
        assert!(manager.ack(ack_id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes_after_deadline() {
        let (broker, ack_id) = setup();
        let manager = AckManager::new(broker, AckManagerConfig { max_messages: 1000, max_millis: 20 });
        let handle = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ack(ack_id).await }
        });
        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn first_error_rejects_remaining_batch() {
        let broker = MessageQueue::new();
        let manager = AckManager::new(broker, AckManagerConfig { max_messages: 2, max_millis: 10_000 });
        let first = manager.ack("unknown-1");
        let second = manager.ack("unknown-2");
        let (r1, r2) = tokio::join!(first, second);
        assert!(r1.is_err());
        assert!(r2.is_err());
    }
}
