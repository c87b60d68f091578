//! `Topic`: a lazily-backed handle to a publish target.
//!
//! A thin name plus a lazily constructed `Publisher`, built on first
//! `publish()` call so that creating a `Topic` reference never has side
//! effects of its own.

use parking_lot::Mutex;

use crate::broker::{MessageQueue, TopicMetadata};
use crate::error::Result;
use crate::message::PublishMessage;
use crate::publisher::{Awaiter, Publisher, PublisherConfig};

/// A reference to a topic within the broker's registry.
pub struct Topic {
    name: String,
    broker: MessageQueue,
    config: PublisherConfig,
    publisher: Mutex<Option<Publisher>>,
}

impl Topic {
    pub(crate) fn new(name: String, broker: MessageQueue, config: PublisherConfig) -> Self {
        Self {
            name,
            broker,
            config,
            publisher: Mutex::new(None),
        }
    }

    /// The fully-qualified `projects/{id}/topics/{name}` name.
    pub fn fully_qualified_name(&self) -> &str {
        &self.name
    }

    /// The bare id, without the `projects/{id}/topics/` prefix.
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn create(&self, metadata: Option<TopicMetadata>) -> Result<()> {
        self.broker.register_topic(&self.name, metadata)
    }

    pub fn delete(&self) -> Result<()> {
        self.broker.unregister_topic(&self.name)
    }

    pub fn exists(&self) -> bool {
        self.broker.topic_exists(&self.name)
    }

    /// Publishes one message, joining the topic's current batch. Constructs
    /// the underlying [`Publisher`] on first use.
    pub async fn publish(&self, message: PublishMessage) -> Result<Awaiter> {
        let publisher = {
            let mut lock = self.publisher.lock();
            if lock.is_none() {
                *lock = Some(Publisher::new(self.broker.clone(), self.name.clone(), self.config.clone()));
            }
            lock.as_ref().unwrap().clone()
        };
        publisher.publish(message).await
    }

    /// Immediately flushes any batch this topic's publisher has accumulated.
    pub fn flush(&self) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            publisher.flush();
        }
    }

    pub fn resume_publishing(&self, ordering_key: &str) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            publisher.resume_publishing(ordering_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    #[tokio::test]
    async fn create_then_exists_then_delete() {
        let broker = MessageQueue::new();
        let topic = Topic::new("projects/p/topics/t".into(), broker, PublisherConfig::default());
        assert!(!topic.exists());
        topic.create(None).unwrap();
        assert!(topic.exists());
        topic.delete().unwrap();
        assert!(!topic.exists());
    }

    #[tokio::test]
    async fn publish_constructs_publisher_lazily() {
        let broker = MessageQueue::new();
        let topic = Topic::new("projects/p/topics/t".into(), broker, PublisherConfig::default());
        topic.create(None).unwrap();
        assert!(topic.publisher.lock().is_none());
        let awaiter = topic.publish(PublishMessage::new("x")).await.unwrap();
        topic.flush();
        assert!(awaiter.get().await.is_ok());
        assert!(topic.publisher.lock().is_some());
    }

    #[tokio::test]
    async fn delete_unknown_topic_fails() {
        let broker = MessageQueue::new();
        let topic = Topic::new("projects/p/topics/missing".into(), broker, PublisherConfig::default());
        let err = topic.delete().unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotFound);
    }
}
