//! Topic and subscription configuration structs.

use std::collections::HashMap;
use std::time::Duration;

/// Minimum and maximum delivery-retry backoff for a subscription.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        }
    }
}

/// Routes messages that exceed `max_delivery_attempts` to `dead_letter_topic`.
#[derive(Clone, Debug)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn new(dead_letter_topic: impl Into<String>, max_delivery_attempts: u32) -> Self {
        Self {
            dead_letter_topic: dead_letter_topic.into(),
            max_delivery_attempts: max_delivery_attempts.clamp(5, 100),
        }
    }
}

/// Broker-enforced inflight admission limits for one subscription, applied
/// at `pull` time against the subscriber's outstanding message/byte count.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionFlowControl {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub allow_excess_messages: bool,
}

impl Default for SubscriptionFlowControl {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_bytes: 104_857_600,
            allow_excess_messages: false,
        }
    }
}

/// Per-subscription configuration.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub ack_deadline_seconds: u16,
    pub enable_message_ordering: bool,
    pub retry_policy: RetryPolicy,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub message_retention_duration: Duration,
    pub flow_control: SubscriptionFlowControl,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ack_deadline_seconds: 10,
            enable_message_ordering: false,
            retry_policy: RetryPolicy::default(),
            dead_letter_policy: None,
            message_retention_duration: Duration::from_secs(604_800),
            flow_control: SubscriptionFlowControl::default(),
        }
    }
}

impl SubscriptionConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_seconds as u64)
    }
}

/// Which regions a topic's messages may be stored in; inert in this emulator
/// (no real storage), kept for API parity with a topic's full field set.
#[derive(Clone, Debug, Default)]
pub struct MessageStoragePolicy {
    pub allowed_persistence_regions: Vec<String>,
}

/// Optional metadata carried by a topic.
#[derive(Clone, Debug, Default)]
pub struct TopicMetadata {
    pub labels: HashMap<String, String>,
    pub schema_name: Option<String>,
    pub message_storage_policy: Option<MessageStoragePolicy>,
    pub message_retention_duration: Option<Duration>,
    pub kms_key_name: Option<String>,
}
