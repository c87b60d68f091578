//! Per-topic batching publisher.
//!
//! Callers get an [`Awaiter`] immediately and the actual handoff to the
//! broker happens on a count/time/byte trigger, batched independently per
//! ordering key. A batch is a `Mutex`-guarded accumulator flushed by
//! whichever trigger fires first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::broker::MessageQueue;
use crate::error::Status;
use crate::flow_control::{PublisherFlowControl, PublisherFlowControlConfig};
use crate::message::PublishMessage;

/// Defaults: 100 messages, 10 ms, 1 MiB.
#[derive(Clone, Copy, Debug)]
pub struct PublisherBatchingConfig {
    pub max_messages: usize,
    pub max_millis: u64,
    pub max_bytes: usize,
}

impl Default for PublisherBatchingConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_millis: 10,
            max_bytes: 1_048_576,
        }
    }
}

#[derive(Clone, Default)]
pub struct PublisherConfig {
    pub batching: PublisherBatchingConfig,
    pub flow_control: PublisherFlowControlConfig,
    pub enable_message_ordering: bool,
}

/// A handle to a message's eventual publish result, returned by
/// [`Publisher::publish`] without blocking on the batch it joined.
#[derive(Debug)]
pub struct Awaiter {
    consumer: oneshot::Receiver<Result<String, Status>>,
}

impl Awaiter {
    pub async fn get(self) -> Result<String, Status> {
        match self.consumer.await {
            Ok(result) => result,
            Err(_) => Err(Status::cancelled("publisher shut down before this batch flushed")),
        }
    }
}

struct Pending {
    bytes: usize,
    waiter: oneshot::Sender<Result<String, Status>>,
}

#[derive(Default)]
struct Batch {
    messages: Vec<PublishMessage>,
    pending: Vec<Pending>,
    bytes: usize,
    timer: Option<JoinHandle<()>>,
}

impl Batch {
    fn push(&mut self, draft: PublishMessage, waiter: oneshot::Sender<Result<String, Status>>) {
        self.bytes += draft.length();
        self.pending.push(Pending { bytes: draft.length(), waiter });
        self.messages.push(draft);
    }

    fn take(&mut self) -> (Vec<PublishMessage>, Vec<Pending>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.bytes = 0;
        (std::mem::take(&mut self.messages), std::mem::take(&mut self.pending))
    }
}

struct Inner {
    broker: MessageQueue,
    topic: String,
    config: Mutex<PublisherConfig>,
    flow_control: PublisherFlowControl,
    default_batch: Mutex<Batch>,
    ordering_batches: Mutex<HashMap<String, Batch>>,
    paused_keys: Mutex<HashSet<String>>,
}

/// Batches publishes for one topic.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub fn new(broker: MessageQueue, topic: impl Into<String>, config: PublisherConfig) -> Self {
        let flow_control = PublisherFlowControl::new(config.flow_control);
        Self {
            inner: Arc::new(Inner {
                broker,
                topic: topic.into(),
                config: Mutex::new(config),
                flow_control,
                default_batch: Mutex::new(Batch::default()),
                ordering_batches: Mutex::new(HashMap::new()),
                paused_keys: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Validates, checks the ordering-key pause state, admits via flow
    /// control (may suspend the caller), then appends to the right batch
    /// and fires its trigger if due.
    pub async fn publish(&self, draft: PublishMessage) -> Result<Awaiter, Status> {
        draft.validate()?;

        let key = draft.ordering_key.clone();
        if let Some(k) = &key {
            if self.inner.paused_keys.lock().contains(k) {
                return Err(Status::invalid_argument(format!(
                    "ordering key {k:?} is paused after a prior batch failure; call resume_publishing first"
                )));
            }
        }

        self.inner.flow_control.acquire(draft.length()).await;

        let (tx, rx) = oneshot::channel();
        let ordering_enabled = self.inner.config.lock().enable_message_ordering;
        let route_key = key.clone().filter(|_| ordering_enabled);

        let should_flush = {
            let batching = self.inner.config.lock().batching;
            let mut batch = self.lock_batch(&route_key);
            batch.push(draft, tx);
            let trigger = batch.messages.len() >= batching.max_messages || batch.bytes >= batching.max_bytes;
            if !trigger && batch.timer.is_none() {
                batch.timer = Some(self.arm_batch_timer(route_key.clone(), batching.max_millis));
            }
            trigger
        };

        if should_flush {
            self.flush_key(route_key);
        }

        Ok(Awaiter { consumer: rx })
    }

    fn lock_batch(&self, key: &Option<String>) -> parking_lot::MappedMutexGuard<'_, Batch> {
        match key {
            Some(k) => parking_lot::MutexGuard::map(self.inner.ordering_batches.lock(), |m| {
                m.entry(k.clone()).or_default()
            }),
            None => parking_lot::MutexGuard::map(self.inner.default_batch.lock(), |b| b),
        }
    }

    fn arm_batch_timer(&self, key: Option<String>, max_millis: u64) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(max_millis)).await;
            publisher.flush_key(key);
        })
    }

    /// Synchronous: the broker's `publish` never suspends, so there's no
    /// async work here beyond what already happened in `acquire`.
    fn flush_key(&self, key: Option<String>) {
        let (messages, pending) = {
            let mut batch = self.lock_batch(&key);
            if batch.messages.is_empty() {
                return;
            }
            batch.take()
        };

        match self.inner.broker.publish(&self.inner.topic, messages) {
            Ok(ids) => {
                for (id, entry) in ids.into_iter().zip(pending) {
                    self.inner.flow_control.release(entry.bytes);
                    let _ = entry.waiter.send(Ok(id));
                }
            }
            Err(status) => {
                for entry in pending {
                    self.inner.flow_control.release(entry.bytes);
                    let _ = entry.waiter.send(Err(status.clone()));
                }
                if let Some(k) = key {
                    self.inner.paused_keys.lock().insert(k);
                }
            }
        }
    }

    /// Clears the pause and discards whatever batch had accumulated for
    /// `key` while it was paused.
    pub fn resume_publishing(&self, key: &str) {
        self.inner.paused_keys.lock().remove(key);
        if let Some(mut batch) = self.inner.ordering_batches.lock().remove(key) {
            let (_messages, pending) = batch.take();
            for entry in pending {
                self.inner.flow_control.release(entry.bytes);
                let _ = entry.waiter.send(Err(Status::cancelled(format!(
                    "batch for ordering key {key:?} discarded by resume_publishing"
                ))));
            }
        }
    }

    /// Immediately triggers every non-empty batch (default plus all ordering
    /// batches) and lets each settle.
    pub fn flush(&self) {
        self.flush_key(None);
        let keys: Vec<String> = self.inner.ordering_batches.lock().keys().cloned().collect();
        for key in keys {
            self.flush_key(Some(key));
        }
    }

    pub fn set_batching_config(&self, batching: PublisherBatchingConfig) {
        self.inner.config.lock().batching = batching;
    }

    /// The same flow-controlled publish path, exposed as a standalone
    /// handle.
    pub fn flow_controlled(&self) -> FlowControlledPublisher<'_> {
        FlowControlledPublisher { publisher: self }
    }
}

/// A façade semantically identical to [`Publisher::publish`], exposed
/// separately for callers that want to hold a flow-controlled publish
/// handle without the rest of the `Publisher` API.
pub struct FlowControlledPublisher<'a> {
    publisher: &'a Publisher,
}

impl FlowControlledPublisher<'_> {
    pub async fn publish(&self, draft: PublishMessage) -> Result<Awaiter, Status> {
        self.publisher.publish(draft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageQueue;

    fn setup(queue: &MessageQueue, topic: &str) {
        queue.register_topic(topic, None).unwrap();
    }

    #[tokio::test]
    async fn count_trigger_flushes_immediately() {
        let queue = MessageQueue::new();
        setup(&queue, "t1");
        let publisher = Publisher::new(
            queue,
            "t1",
            PublisherConfig {
                batching: PublisherBatchingConfig { max_messages: 2, max_millis: 10_000, max_bytes: usize::MAX },
                ..Default::default()
            },
        );
        let a = publisher.publish(PublishMessage::new("a")).await.unwrap();
        let b = publisher.publish(PublishMessage::new("b")).await.unwrap();
        let (ra, rb) = tokio::join!(a.get(), b.get());
        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert_ne!(ra.unwrap(), rb.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes_after_deadline() {
        let queue = MessageQueue::new();
        setup(&queue, "t1");
        let publisher = Publisher::new(
            queue,
            "t1",
            PublisherConfig {
                batching: PublisherBatchingConfig { max_messages: 1000, max_millis: 20, max_bytes: usize::MAX },
                ..Default::default()
            },
        );
        let a = publisher.publish(PublishMessage::new("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(a.get().await.is_ok());
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_rejects_all_handles() {
        let queue = MessageQueue::new();
        // No register_topic call: the topic doesn't exist.
        let publisher = Publisher::new(
            queue,
            "missing",
            PublisherConfig {
                batching: PublisherBatchingConfig { max_messages: 1, max_millis: 10_000, max_bytes: usize::MAX },
                ..Default::default()
            },
        );
        let a = publisher.publish(PublishMessage::new("a")).await.unwrap();
        assert!(a.get().await.is_err());
    }

    #[tokio::test]
    async fn ordering_key_pauses_after_batch_failure() {
        let queue = MessageQueue::new();
        let publisher = Publisher::new(
            queue,
            "missing",
            PublisherConfig {
                batching: PublisherBatchingConfig { max_messages: 1, max_millis: 10_000, max_bytes: usize::MAX },
                enable_message_ordering: true,
                ..Default::default()
            },
        );
        let a = publisher
            .publish(PublishMessage::new("a").with_ordering_key("k1"))
            .await
            .unwrap();
        assert!(a.get().await.is_err());

        let err = publisher
            .publish(PublishMessage::new("b").with_ordering_key("k1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);

        publisher.resume_publishing("k1");
        let queue2 = MessageQueue::new();
        queue2.register_topic("t2", None).unwrap();
        let publisher2 = Publisher::new(queue2, "t2", PublisherConfig { enable_message_ordering: true, ..Default::default() });
        let c = publisher2
            .publish(PublishMessage::new("c").with_ordering_key("k1"))
            .await
            .unwrap();
        publisher2.flush();
        assert!(c.get().await.is_ok());
    }
}
