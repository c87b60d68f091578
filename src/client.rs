//! `Client`: the project-scoped entry point.
//!
//! Holds one [`MessageQueue`] and hands out memoized `Topic`/`Subscription`/
//! `Schema` handles by name. There's no connection pool to own, so
//! construction is synchronous and infallible.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::MessageQueue;
use crate::publisher::PublisherConfig;
use crate::schema::{BoundSchemaValidator, Schema};
use crate::subscription::Subscription;
use crate::message_stream::MessageStreamConfig;
use crate::topic::Topic;

/// Project id resolution order: explicit arg, then three environment
/// variables in priority order, then a hardcoded fallback.
fn resolve_project_id(explicit: Option<&str>) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    for var in ["PUBSUB_PROJECT_ID", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    "local-project".to_string()
}

#[derive(Clone, Default)]
pub struct ClientConfig {
    pub publisher: PublisherConfig,
    pub message_stream: MessageStreamConfig,
}

/// A Pub/Sub client scoped to a single project. Cheap to clone; every clone
/// shares the same broker and the same per-name handle cache.
#[derive(Clone)]
pub struct Client {
    project_id: String,
    broker: MessageQueue,
    config: ClientConfig,
    topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
    subscriptions: Arc<Mutex<HashMap<String, Arc<Subscription>>>>,
    schemas: Arc<Mutex<HashMap<String, Arc<Schema>>>>,
}

impl Client {
    /// `project_id` resolves through env vars when omitted; there's no
    /// separate emulator mode since this client is always in-process.
    pub fn new(project_id: Option<&str>) -> Self {
        Self::with_config(project_id, ClientConfig::default())
    }

    pub fn with_config(project_id: Option<&str>, config: ClientConfig) -> Self {
        Self {
            project_id: resolve_project_id(project_id),
            broker: MessageQueue::new(),
            config,
            topics: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            schemas: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn fully_qualified_topic_name(&self, id: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, id)
    }

    pub fn fully_qualified_subscription_name(&self, id: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, id)
    }

    pub fn fully_qualified_schema_name(&self, id: &str) -> String {
        format!("projects/{}/schemas/{}", self.project_id, id)
    }

    /// Returns the memoized `Topic` for `id`, constructing one on first
    /// request. A later call for the same id ignores any new options.
    pub fn topic(&self, id: &str) -> Arc<Topic> {
        let name = self.fully_qualified_topic_name(id);
        self.topics
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Topic::new(name, self.broker.clone(), self.config.publisher.clone())))
            .clone()
    }

    /// Returns the memoized `Subscription` for `id`.
    pub fn subscription(&self, id: &str) -> Arc<Subscription> {
        let name = self.fully_qualified_subscription_name(id);
        self.subscriptions
            .lock()
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Subscription::new(name, self.broker.clone(), self.config.message_stream.clone()))
            })
            .clone()
    }

    /// Returns the memoized schema handle for `id`, bound to a validator
    /// that (body validation is unimplemented) rejects every message.
    pub fn schema(&self, id: &str, schema: Schema) -> Arc<Schema> {
        let name = self.fully_qualified_schema_name(id);
        self.schemas.lock().entry(name).or_insert_with(|| Arc::new(schema)).clone()
    }

    /// Builds a broker seeded to reject every message against the given
    /// schema; body validation itself is unimplemented.
    pub fn with_schema_validation(project_id: Option<&str>, schema: Schema) -> Self {
        Self {
            project_id: resolve_project_id(project_id),
            broker: MessageQueue::with_schema_validator(Box::new(BoundSchemaValidator::new(schema))),
            config: ClientConfig::default(),
            topics: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            schemas: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
