//! `Subscription`: the client-facing handle to a subscription's delivery
//! stream.
//!
//! Where `Topic` lazily owns a `Publisher`, `Subscription` lazily owns a
//! `MessageStream` — `receive()` constructs one on first call and tears it
//! down when the handler future returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::{MessageQueue, SubscriptionConfig};
use crate::error::Result;
use crate::message_stream::{MessageStream, MessageStreamConfig, ReceivedMessage};

/// A reference to a subscription within the broker's registry.
pub struct Subscription {
    name: String,
    broker: MessageQueue,
    stream_config: MessageStreamConfig,
    stream: Mutex<Option<MessageStream>>,
}

impl Subscription {
    pub(crate) fn new(name: String, broker: MessageQueue, stream_config: MessageStreamConfig) -> Self {
        Self {
            name,
            broker,
            stream_config,
            stream: Mutex::new(None),
        }
    }

    pub fn fully_qualified_name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn create(&self, topic: &str, config: Option<SubscriptionConfig>) -> Result<()> {
        self.broker.register_subscription(&self.name, topic, config)
    }

    pub fn delete(&self) -> Result<()> {
        self.broker.unregister_subscription(&self.name)
    }

    pub fn exists(&self) -> bool {
        self.broker.subscription_exists(&self.name)
    }

    /// Pulls up to `max` messages without starting a streaming consumer.
    /// The caller is responsible for acking/nacking via the returned handles.
    pub fn pull(&self, max: usize) -> Result<Vec<(String, crate::message::Message)>> {
        self.broker.pull(&self.name, max)
    }

    pub fn ack(&self, ack_id: &str) -> Result<()> {
        self.broker.ack(ack_id)
    }

    pub fn nack(&self, ack_id: &str) -> Result<()> {
        self.broker.nack(ack_id)
    }

    /// Starts a [`MessageStream`] against this subscription and runs `handler`
    /// for each delivery until `stop()` is called on the returned
    /// [`ReceiveHandle`]. Calling `receive` again after stopping starts a
    /// fresh stream.
    pub fn receive<F, Fut>(&self, handler: F) -> ReceiveHandle
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stream = MessageStream::new(self.broker.clone(), self.name.clone(), self.stream_config.clone());
        let boxed: Arc<dyn Fn(ReceivedMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync> =
            Arc::new(move |received| Box::pin(handler(received)));
        stream.start(boxed);
        *self.stream.lock() = Some(stream.clone());
        ReceiveHandle { stream }
    }
}

/// Controls a subscription's in-flight `receive()` stream.
pub struct ReceiveHandle {
    stream: MessageStream,
}

impl ReceiveHandle {
    pub fn pause(&self) {
        self.stream.pause();
    }

    pub fn resume(&self) {
        self.stream.resume();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn last_error(&self) -> Option<crate::error::Status> {
        self.stream.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PublishMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[ctor::ctor]
    fn init() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    #[tokio::test]
    async fn create_exists_delete_round_trip() {
        let broker = MessageQueue::new();
        broker.register_topic("t", None).unwrap();
        let sub = Subscription::new("s".into(), broker, MessageStreamConfig::default());
        assert!(!sub.exists());
        sub.create("t", None).unwrap();
        assert!(sub.exists());
        sub.delete().unwrap();
        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn pull_and_ack_without_streaming() {
        let broker = MessageQueue::new();
        broker.register_topic("t", None).unwrap();
        let sub = Subscription::new("s".into(), broker.clone(), MessageStreamConfig::default());
        sub.create("t", None).unwrap();
        broker.publish("t", vec![PublishMessage::new("hello")]).unwrap();
        let pulled = sub.pull(10).unwrap();
        assert_eq!(pulled.len(), 1);
        let (ack_id, _) = &pulled[0];
        assert!(sub.ack(ack_id).is_ok());
    }

    #[tokio::test]
    async fn receive_delivers_and_stop_drains() {
        let broker = MessageQueue::new();
        broker.register_topic("t", None).unwrap();
        let sub = Subscription::new("s".into(), broker.clone(), MessageStreamConfig::default());
        sub.create("t", None).unwrap();
        broker.publish("t", vec![PublishMessage::new("x")]).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = sub.receive(move |received: ReceivedMessage| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = received.ack().await;
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
