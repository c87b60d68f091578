//! Per-subscription queue state.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::broker::config::SubscriptionConfig;
use crate::message::Message;

/// A message sitting out a nack/expiry backoff delay before it's eligible
/// again.
pub struct BackoffEntry {
    pub message: Message,
}

/// A message that has been pulled and leased but not yet resolved.
pub struct InFlightEntry {
    pub message: Message,
}

/// The four queue variants a subscription owns, plus its config and
/// accounting.
pub struct SubscriptionState {
    pub topic: String,
    pub config: SubscriptionConfig,
    pub available: VecDeque<Message>,
    pub ordering_queues: HashMap<String, VecDeque<Message>>,
    pub ordering_in_flight: HashSet<String>,
    pub backoff: Vec<BackoffEntry>,
    pub in_flight: HashMap<String, InFlightEntry>,
    /// Set by `unregister_subscription`; a revoked state no longer accepts
    /// publishes or reinserts backoff-delayed messages, but the struct stays
    /// alive as long as something (a pending timer) still holds an `Arc` to
    /// it.
    pub revoked: bool,
}

impl SubscriptionState {
    pub fn new(topic: impl Into<String>, config: SubscriptionConfig) -> Self {
        Self {
            topic: topic.into(),
            config,
            available: VecDeque::new(),
            ordering_queues: HashMap::new(),
            ordering_in_flight: HashSet::new(),
            backoff: Vec::new(),
            in_flight: HashMap::new(),
            revoked: false,
        }
    }

    /// Total messages currently tracked by this subscription across every
    /// queue variant.
    pub fn message_count(&self) -> usize {
        self.available.len()
            + self.ordering_queues.values().map(VecDeque::len).sum::<usize>()
            + self.backoff.len()
            + self.in_flight.len()
    }

    pub fn queued_bytes(&self) -> usize {
        let available: usize = self.available.iter().map(Message::length).sum();
        let ordering: usize = self
            .ordering_queues
            .values()
            .flat_map(|q| q.iter())
            .map(Message::length)
            .sum();
        let backoff: usize = self.backoff.iter().map(|e| e.message.length()).sum();
        let in_flight: usize = self.in_flight.values().map(|e| e.message.length()).sum();
        available + ordering + backoff + in_flight
    }

    /// Admits a published copy into the correct queue for this subscription.
    pub fn admit(&mut self, message: Message) {
        match &message.ordering_key {
            Some(key) if self.config.enable_message_ordering => {
                self.ordering_queues.entry(key.clone()).or_default().push_back(message);
            }
            _ => self.available.push_back(message),
        }
    }

    /// Re-admits a message at the *head* of its origin queue, as required
    /// when a nacked/expired message is requeued — a nacked ordered message
    /// returns to the head of its key's queue so redelivery preserves order.
    pub fn requeue_front(&mut self, message: Message) {
        match &message.ordering_key {
            Some(key) if self.config.enable_message_ordering => {
                self.ordering_queues.entry(key.clone()).or_default().push_front(message);
            }
            _ => self.available.push_front(message),
        }
    }

    /// `available` before `ordering_queues`, FIFO within each.
    pub fn next_eligible(&mut self) -> Option<Message> {
        if let Some(message) = self.available.pop_front() {
            return Some(message);
        }
        for (key, queue) in self.ordering_queues.iter_mut() {
            if self.ordering_in_flight.contains(key) {
                continue;
            }
            if let Some(message) = queue.pop_front() {
                self.ordering_in_flight.insert(key.clone());
                return Some(message);
            }
        }
        None
    }
}
