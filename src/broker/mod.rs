//! `MessageQueue`: the broker at the center of the emulator.
//!
//! Owns every topic, subscription, message, and lease. Everything else in
//! this crate — `Publisher`, `MessageStream`, the `Client` façade — is a
//! collaborator that holds a [`MessageQueue`] handle and never mutates
//! broker state directly; it's the thin-façade-over-a-shared-backend split
//! a Pub/Sub client library draws between `Topic`/`Subscription` and the
//! connection underneath them.

pub mod config;
mod lease;
mod state;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Result, Status};
use crate::message::{Message, PublishMessage};
use crate::schema::{NoSchema, SchemaValidator};
use crate::time::PreciseDate;

pub use config::{
    DeadLetterPolicy, MessageStoragePolicy, RetryPolicy, SubscriptionConfig,
    SubscriptionFlowControl, TopicMetadata,
};
pub use state::SubscriptionState;

use lease::{ActiveLease, LeaseEntry};
use state::{BackoffEntry, InFlightEntry};

/// Age past which an orphaned lease (expired inflight slot, tombstoned by an
/// unregister) is reclaimed by periodic cleanup.
const ORPHAN_LEASE_GC_AGE: Duration = Duration::from_secs(600);
/// Periodic cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Per-subscription soft caps on queued content.
const QUEUE_SOFT_CAP_MESSAGES: usize = 10_000;
const QUEUE_SOFT_CAP_BYTES: usize = 100 * 1024 * 1024;

struct TopicRecord {
    metadata: TopicMetadata,
    subscriptions: HashSet<String>,
}

struct Registry {
    topics: HashMap<String, TopicRecord>,
    subscriptions: HashMap<String, Arc<Mutex<SubscriptionState>>>,
}

struct Inner {
    registry: RwLock<Registry>,
    leases: Mutex<HashMap<String, LeaseEntry>>,
    schema_validator: Box<dyn SchemaValidator>,
    next_message_id: AtomicU64,
    next_ack_id: AtomicU64,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
        for entry in self.leases.get_mut().values() {
            if let LeaseEntry::Active(lease) = entry {
                lease.timer.abort();
            }
        }
    }
}

/// The broker. Cheaply cloneable — every clone shares the same state. It
/// behaves like a singleton with explicit construction, modeled as an
/// ordinary value callers construct once and share via `clone()`/`Arc`
/// rather than a hidden global, so isolated instances are trivial in tests.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::with_schema_validator(Box::new(NoSchema))
    }

    pub fn with_schema_validator(schema_validator: Box<dyn SchemaValidator>) -> Self {
        let inner = Arc::new(Inner {
            registry: RwLock::new(Registry {
                topics: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            leases: Mutex::new(HashMap::new()),
            schema_validator,
            next_message_id: AtomicU64::new(0),
            next_ack_id: AtomicU64::new(0),
            cleanup_task: Mutex::new(None),
        });
        let queue = Self { inner };
        queue.spawn_cleanup_task();
        queue
    }

    fn spawn_cleanup_task(&self) {
        // A weak handle, not a strong clone: a strong `Arc` held by this
        // task would keep `Inner`'s refcount above zero forever, so `Drop`
        // (the only thing that aborts this task) would never run.
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => MessageQueue { inner }.run_cleanup(),
                    None => break,
                }
            }
        });
        *self.inner.cleanup_task.lock() = Some(handle);
    }

    fn mint_message_id(&self) -> String {
        let n = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        format!("m{n:016x}")
    }

    fn mint_ack_id(&self) -> String {
        let n = self.inner.next_ack_id.fetch_add(1, Ordering::Relaxed);
        format!("a{n:016x}")
    }

    // ---- topic / subscription registry -------------------------------

    pub fn register_topic(&self, name: &str, metadata: Option<TopicMetadata>) -> Result<()> {
        let mut registry = self.inner.registry.write();
        if registry.topics.contains_key(name) {
            return Err(Status::already_exists(format!("topic {name} already exists")));
        }
        registry.topics.insert(
            name.to_string(),
            TopicRecord {
                metadata: metadata.unwrap_or_default(),
                subscriptions: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Detaches the topic; bound subscriptions keep their queues and keep
    /// delivering already-admitted messages, but further publishes to this
    /// name fail `NOT_FOUND`.
    pub fn unregister_topic(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.registry.write();
        if registry.topics.remove(name).is_none() {
            return Err(Status::not_found(format!("topic {name} not found")));
        }
        Ok(())
    }

    pub fn register_subscription(
        &self,
        name: &str,
        topic: &str,
        config: Option<SubscriptionConfig>,
    ) -> Result<()> {
        let mut registry = self.inner.registry.write();
        if registry.subscriptions.contains_key(name) {
            return Err(Status::already_exists(format!("subscription {name} already exists")));
        }
        let topic_record = registry
            .topics
            .get_mut(topic)
            .ok_or_else(|| Status::not_found(format!("topic {topic} not found")))?;
        topic_record.subscriptions.insert(name.to_string());
        registry.subscriptions.insert(
            name.to_string(),
            Arc::new(Mutex::new(SubscriptionState::new(topic, config.unwrap_or_default()))),
        );
        Ok(())
    }

    /// Cancels every outstanding lease for this subscription and tombstones
    /// their ackIds so a later ack/nack/modAck can distinguish "never
    /// existed" from "existed, but the subscription is gone" (see
    /// [`lease::LeaseEntry::Revoked`]).
    pub fn unregister_subscription(&self, name: &str) -> Result<()> {
        let sub_state = {
            let mut registry = self.inner.registry.write();
            if let Some(topic_record) = registry
                .subscriptions
                .get(name)
                .map(|s| s.lock().topic.clone())
                .and_then(|topic| registry.topics.get_mut(&topic))
            {
                topic_record.subscriptions.remove(name);
            }
            registry
                .subscriptions
                .remove(name)
                .ok_or_else(|| Status::not_found(format!("subscription {name} not found")))?
        };

        let mut state = sub_state.lock();
        state.revoked = true;
        let ack_ids: Vec<String> = state.in_flight.keys().cloned().collect();
        drop(state);

        let mut leases = self.inner.leases.lock();
        for ack_id in ack_ids {
            if let Some(LeaseEntry::Active(lease)) = leases.get(&ack_id) {
                lease.timer.abort();
            }
            leases.insert(ack_id, LeaseEntry::Revoked { created_at: Instant::now() });
        }
        Ok(())
    }

    fn subscription_handle(&self, name: &str) -> Result<Arc<Mutex<SubscriptionState>>> {
        self.inner
            .registry
            .read()
            .subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("subscription {name} not found")))
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.inner.registry.read().topics.contains_key(name)
    }

    pub fn subscription_exists(&self, name: &str) -> bool {
        self.inner.registry.read().subscriptions.contains_key(name)
    }

    // ---- publish --------------------------------------------------------

    /// Validates and admits a batch of messages onto `topic`, copying each
    /// into every bound subscription's queues. Every bound subscription sees
    /// every admitted message, independent of what the others do with it.
    pub fn publish(&self, topic: &str, drafts: Vec<PublishMessage>) -> Result<Vec<String>> {
        for draft in &drafts {
            draft.validate()?;
            self.inner.schema_validator.validate_message(draft)?;
        }

        let registry = self.inner.registry.read();
        let topic_record = registry
            .topics
            .get(topic)
            .ok_or_else(|| Status::not_found(format!("topic {topic} not found")))?;
        let subscriptions: Vec<Arc<Mutex<SubscriptionState>>> = topic_record
            .subscriptions
            .iter()
            .filter_map(|name| registry.subscriptions.get(name).cloned())
            .collect();
        drop(registry);

        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = self.mint_message_id();
            let publish_time = PreciseDate::now();
            for sub_state in &subscriptions {
                let mut state = sub_state.lock();
                if state.message_count() >= QUEUE_SOFT_CAP_MESSAGES
                    || state.queued_bytes() >= QUEUE_SOFT_CAP_BYTES
                {
                    tracing::warn!(
                        topic,
                        message_id = %id,
                        "subscription queue soft cap exceeded; dropping admission for this subscription"
                    );
                    continue;
                }
                let copy = Message::admit(id.clone(), draft.clone(), publish_time);
                state.admit(copy);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    // ---- pull -------------------------------------------------------------

    /// Pulls up to `max` messages, minting a fresh ackId and arming a lease
    /// timer for each.
    pub fn pull(&self, subscription: &str, max: usize) -> Result<Vec<(String, Message)>> {
        let sub_state = self.subscription_handle(subscription)?;
        let mut out = Vec::new();
        loop {
            if out.len() >= max {
                break;
            }
            let mut state = sub_state.lock();
            let budget = state
                .config
                .flow_control
                .max_messages
                .saturating_sub(state.in_flight.len());
            if budget == 0 {
                break;
            }
            let Some(message) = state.next_eligible() else {
                break;
            };
            if !state.config.flow_control.allow_excess_messages
                && state.queued_bytes() > state.config.flow_control.max_bytes
            {
                // Put it back; we've exceeded the byte budget for this pull.
                // `next_eligible` already marked the key in-flight when the
                // message came from an ordering queue — undo that too, or
                // the key would wedge forever with nothing actually leased.
                if let Some(key) = &message.ordering_key {
                    state.ordering_in_flight.remove(key);
                }
                state.requeue_front(message);
                break;
            }
            let ack_id = self.mint_ack_id();
            let deadline_secs = state.config.ack_deadline_seconds;
            let timer = self.spawn_lease_timer(ack_id.clone(), Duration::from_secs(deadline_secs as u64));
            state.in_flight.insert(
                ack_id.clone(),
                InFlightEntry { message: message.clone() },
            );
            drop(state);

            self.inner.leases.lock().insert(
                ack_id.clone(),
                LeaseEntry::Active(ActiveLease {
                    subscription: subscription.to_string(),
                    message_id: message.id.clone(),
                    ordering_key: message.ordering_key.clone(),
                    deadline: PreciseDate::now().plus(Duration::from_secs(deadline_secs as u64)),
                    created_at: Instant::now(),
                    timer,
                }),
            );
            out.push((ack_id, message));
        }
        Ok(out)
    }

    fn spawn_lease_timer(&self, ack_id: String, after: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            queue.expire_lease(&ack_id);
        })
    }

    // ---- ack / nack / modAck ----------------------------------------------

    /// Takes the lease for `ack_id` out of the global index, validating it
    /// exists and isn't a revoked tombstone. Aborts the lease timer.
    fn take_active_lease(&self, ack_id: &str) -> Result<ActiveLease> {
        let mut leases = self.inner.leases.lock();
        match leases.remove(ack_id) {
            None => Err(Status::invalid_argument(format!("unknown ackId {ack_id}"))),
            Some(LeaseEntry::Revoked { created_at }) => {
                leases.insert(ack_id.to_string(), LeaseEntry::Revoked { created_at });
                Err(Status::failed_precondition(format!(
                    "subscription for ackId {ack_id} was unregistered"
                )))
            }
            Some(LeaseEntry::Active(lease)) => {
                lease.timer.abort();
                Ok(lease)
            }
        }
    }

    pub fn ack(&self, ack_id: &str) -> Result<()> {
        let lease = self.take_active_lease(ack_id)?;
        if let Ok(sub_state) = self.subscription_handle(&lease.subscription) {
            let mut state = sub_state.lock();
            state.in_flight.remove(ack_id);
            if let Some(key) = &lease.ordering_key {
                state.ordering_in_flight.remove(key);
            }
        }
        Ok(())
    }

    /// Fire-and-forget variant used by timer callbacks and teardown paths:
    /// swallows `FAILED_PRECONDITION` with a warning, logs anything else.
    pub(crate) fn ack_and_forget(&self, ack_id: &str) {
        if let Err(status) = self.ack(ack_id) {
            self.log_fire_and_forget_error("ack", ack_id, &status);
        }
    }

    pub fn nack(&self, ack_id: &str) -> Result<()> {
        let lease = self.take_active_lease(ack_id)?;
        self.redeliver(ack_id, lease)
    }

    pub(crate) fn nack_and_forget(&self, ack_id: &str) {
        if let Err(status) = self.nack(ack_id) {
            self.log_fire_and_forget_error("nack", ack_id, &status);
        }
    }

    fn log_fire_and_forget_error(&self, op: &str, ack_id: &str, status: &Status) {
        if status.code() == crate::error::Code::FailedPrecondition {
            tracing::warn!(op, ack_id, %status, "swallowed fire-and-forget error");
        } else {
            tracing::error!(op, ack_id, %status, "unexpected fire-and-forget error");
        }
    }

    pub fn modify_ack_deadline(&self, ack_id: &str, seconds: u16) -> Result<()> {
        if seconds > 600 {
            return Err(Status::invalid_argument("ack deadline extension must be <= 600s"));
        }
        if seconds == 0 {
            return self.nack(ack_id);
        }
        let mut leases = self.inner.leases.lock();
        match leases.get_mut(ack_id) {
            None => Err(Status::invalid_argument(format!("unknown ackId {ack_id}"))),
            Some(LeaseEntry::Revoked { .. }) => Err(Status::failed_precondition(format!(
                "subscription for ackId {ack_id} was unregistered"
            ))),
            Some(LeaseEntry::Active(lease)) => {
                lease.timer.abort();
                lease.timer = self.spawn_lease_timer(ack_id.to_string(), Duration::from_secs(seconds as u64));
                Ok(())
            }
        }
    }

    fn expire_lease(&self, ack_id: &str) {
        let lease = {
            let mut leases = self.inner.leases.lock();
            match leases.remove(ack_id) {
                Some(LeaseEntry::Active(lease)) => lease,
                _ => return,
            }
        };
        if let Err(status) = self.redeliver(ack_id, lease) {
            tracing::error!(ack_id, %status, "lease expiry redelivery failed");
        }
    }

    /// Shared nack/expiry path: increments `deliveryAttempt`, routes to DLQ
    /// or schedules a backoff-delayed requeue.
    fn redeliver(&self, ack_id: &str, lease: ActiveLease) -> Result<()> {
        let sub_state = self.subscription_handle(&lease.subscription)?;
        let mut message = {
            let mut state = sub_state.lock();
            match state.in_flight.remove(ack_id) {
                Some(entry) => entry.message,
                None => return Ok(()), // already resolved concurrently
            }
        };
        message.delivery_attempt += 1;

        let dlq_target = {
            let state = sub_state.lock();
            state
                .config
                .dead_letter_policy
                .as_ref()
                .filter(|policy| message.delivery_attempt > policy.max_delivery_attempts)
                .map(|policy| policy.dead_letter_topic.clone())
        };

        if let Some(dlq_topic) = dlq_target {
            if let Some(key) = &lease.ordering_key {
                sub_state.lock().ordering_in_flight.remove(key);
            }
            let draft = PublishMessage {
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                ordering_key: message.ordering_key.clone(),
            };
            if let Err(status) = self.publish(&dlq_topic, vec![draft]) {
                tracing::error!(dlq_topic, %status, "failed to route message to dead-letter topic");
            }
            return Ok(());
        }

        let (min_backoff, max_backoff) = {
            let state = sub_state.lock();
            (state.config.retry_policy.min_backoff, state.config.retry_policy.max_backoff)
        };
        let exponent = message.delivery_attempt.saturating_sub(1).min(30);
        let scaled = min_backoff.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let backoff = scaled.min(max_backoff);

        {
            let mut state = sub_state.lock();
            state.backoff.push(BackoffEntry { message: message.clone() });
        }

        let queue = self.clone();
        let sub_name = lease.subscription.clone();
        let message_id = message.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            queue.release_from_backoff(&sub_name, &message_id);
        });
        Ok(())
    }

    fn release_from_backoff(&self, subscription: &str, message_id: &str) {
        let Ok(sub_state) = self.subscription_handle(subscription) else {
            return;
        };
        let mut state = sub_state.lock();
        if state.revoked {
            return;
        }
        let Some(idx) = state.backoff.iter().position(|e| e.message.id == message_id) else {
            return;
        };
        let entry = state.backoff.remove(idx);
        if let Some(key) = &entry.message.ordering_key {
            state.ordering_in_flight.remove(key);
        }
        state.requeue_front(entry.message);
    }

    // ---- cleanup ------------------------------------------------------

    fn run_cleanup(&self) {
        let now = PreciseDate::now();
        let subscriptions: Vec<Arc<Mutex<SubscriptionState>>> = self
            .inner
            .registry
            .read()
            .subscriptions
            .values()
            .cloned()
            .collect();

        for sub_state in subscriptions {
            let mut state = sub_state.lock();
            let retention = state.config.message_retention_duration;
            state.available.retain(|m| !m.publish_time.elapsed_by(retention, now));
            for queue in state.ordering_queues.values_mut() {
                queue.retain(|m| !m.publish_time.elapsed_by(retention, now));
            }
            state.backoff.retain(|e| !e.message.publish_time.elapsed_by(retention, now));
        }

        let mut leases = self.inner.leases.lock();
        let expired: Vec<String> = leases
            .iter()
            .filter(|(_, entry)| {
                matches!(entry, LeaseEntry::Revoked { .. })
                    && entry.created_at().elapsed() > ORPHAN_LEASE_GC_AGE
            })
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            leases.remove(&ack_id);
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
