//! Subscriber core: N concurrent pull workers, ordering-key serialization of
//! delivery, pause/resume, and WAIT/NACK stop semantics.
//!
//! A receive loop spawns one pull worker per configured stream, plus a
//! timeout task, and tracks unresolved deliveries in the `dispatched` map
//! for graceful shutdown. Pulls go straight to a `MessageQueue` in-process
//! rather than over a wire connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ack_manager::{AckManager, AckManagerConfig};
use crate::broker::MessageQueue;
use crate::error::{Code, Status};
use crate::flow_control::{SubscriberFlowControl, SubscriberFlowControlConfig};
use crate::lease_manager::{LeaseManager, LeaseManagerConfig};
use crate::message::Message;

/// Defaults: 5 streams, 10 ms pulls, 100 messages per pull, 300 s overall
/// stream timeout.
#[derive(Clone, Copy, Debug)]
pub struct StreamingOptions {
    pub max_streams: usize,
    pub pull_interval: Duration,
    pub max_pull_size: usize,
    pub timeout: Duration,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            max_streams: 5,
            pull_interval: Duration::from_millis(10),
            max_pull_size: 100,
            timeout: Duration::from_millis(300_000),
        }
    }
}

/// How `stop()` drains currently-dispatched, unresolved deliveries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Wait for in-flight deliveries to resolve themselves, up to `timeout`.
    Wait,
    /// Nack every in-flight delivery immediately.
    Nack,
}

/// Defaults to `Wait` with a generous timeout, and exposes both as
/// configuration for callers that want to nack-and-drain instead.
#[derive(Clone, Copy, Debug)]
pub struct CloseOptions {
    pub behavior: CloseBehavior,
    pub timeout: Duration,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self { behavior: CloseBehavior::Wait, timeout: Duration::from_secs(60) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

#[derive(Clone)]
pub struct MessageStreamConfig {
    pub flow_control: SubscriberFlowControlConfig,
    pub ack_deadline: Duration,
    pub lease_manager: LeaseManagerConfig,
    pub ack_manager: AckManagerConfig,
    pub streaming: StreamingOptions,
    pub close: CloseOptions,
    pub enable_message_ordering: bool,
    /// Accepted for API parity; this emulator's flow control semantics
    /// don't distinguish a "legacy" mode.
    pub use_legacy_flow_control: bool,
}

impl Default for MessageStreamConfig {
    fn default() -> Self {
        Self {
            flow_control: SubscriberFlowControlConfig::default(),
            ack_deadline: Duration::from_secs(10),
            lease_manager: LeaseManagerConfig::default(),
            ack_manager: AckManagerConfig::default(),
            streaming: StreamingOptions::default(),
            close: CloseOptions::default(),
            enable_message_ordering: false,
            use_legacy_flow_control: false,
        }
    }
}

struct DispatchedInfo {
    bytes: usize,
    ordering_key: Option<String>,
}

struct OrderingState {
    in_dispatch: HashSet<String>,
    held: HashMap<String, VecDeque<(String, Message)>>,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(ReceivedMessage) -> BoxFuture + Send + Sync>;

struct Shared {
    broker: MessageQueue,
    subscription: String,
    config: MessageStreamConfig,
    flow_control: SubscriberFlowControl,
    lease_manager: LeaseManager,
    ack_manager: AckManager,
    ordering: Mutex<OrderingState>,
    dispatched: Mutex<HashMap<String, DispatchedInfo>>,
    last_error: Mutex<Option<Status>>,
    handler: Mutex<Option<Handler>>,
    state_tx: watch::Sender<StreamState>,
}

/// One delivered-but-unresolved message, handed to the consumer callback.
pub struct ReceivedMessage {
    pub message: Message,
    ack_id: String,
    shared: Arc<Shared>,
}

impl ReceivedMessage {
    pub fn delivery_attempt(&self) -> u32 {
        self.message.delivery_attempt
    }

    pub async fn ack(self) -> Result<(), Status> {
        let result = self.shared.ack_manager.ack(self.ack_id.clone()).await;
        self.shared.resolve(&self.ack_id);
        result
    }

    pub async fn nack(self) -> Result<(), Status> {
        let result = self.shared.ack_manager.nack(self.ack_id.clone()).await;
        self.shared.resolve(&self.ack_id);
        result
    }

    pub async fn modify_ack_deadline(&self, seconds: u16) -> Result<(), Status> {
        self.shared.ack_manager.modify_ack_deadline(self.ack_id.clone(), seconds).await
    }
}

impl Shared {
    /// Releases bookkeeping for a resolved delivery and, under ordering,
    /// dispatches the next held message for its key.
    fn resolve(self: &Arc<Self>, ack_id: &str) {
        let Some(info) = self.dispatched.lock().remove(ack_id) else { return };
        self.lease_manager.remove_lease(ack_id);
        self.flow_control.remove_message(info.bytes);

        let Some(key) = info.ordering_key else { return };
        let next = {
            let mut ordering = self.ordering.lock();
            ordering.in_dispatch.remove(&key);
            match ordering.held.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(next) => {
                    ordering.in_dispatch.insert(key);
                    Some(next)
                }
                None => None,
            }
        };
        // `dispatched` already carries an entry for `next_ack_id` from when it
        // was first pulled and held, so only dispatch needs to happen here.
        if let Some((next_ack_id, next_message)) = next {
            if let Some(handler) = self.handler.lock().clone() {
                spawn_dispatch(self.clone(), handler, next_ack_id, next_message);
            }
        }
    }
}

/// Owns the lifecycle of a running subscription consumer.
#[derive(Clone)]
pub struct MessageStream {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<StreamState>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    timeout_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MessageStream {
    pub fn new(broker: MessageQueue, subscription: impl Into<String>, config: MessageStreamConfig) -> Self {
        let subscription = subscription.into();
        let lease_manager = LeaseManager::new(
            broker.clone(),
            subscription.clone(),
            config.ack_deadline,
            config.lease_manager,
        );
        let ack_manager = AckManager::new(broker.clone(), config.ack_manager);
        let flow_control = SubscriberFlowControl::new(config.flow_control);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let shared = Arc::new(Shared {
            broker,
            subscription,
            config,
            flow_control,
            lease_manager,
            ack_manager,
            ordering: Mutex::new(OrderingState { in_dispatch: HashSet::new(), held: HashMap::new() }),
            dispatched: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            handler: Mutex::new(None),
            state_tx,
        });
        Self {
            shared,
            state_rx,
            workers: Arc::new(Mutex::new(Vec::new())),
            timeout_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    pub fn last_error(&self) -> Option<Status> {
        self.shared.last_error.lock().clone()
    }

    /// Idle → Running: spawns `maxStreams` independent pull workers.
    pub fn start(&self, handler: Handler) {
        *self.shared.handler.lock() = Some(handler.clone());
        let _ = self.shared.state_tx.send(StreamState::Running);
        let streams = self.shared.config.streaming.max_streams;
        let mut workers = self.workers.lock();
        for _ in 0..streams {
            workers.push(self.spawn_worker());
        }
        drop(workers);

        let timeout = self.shared.config.streaming.timeout;
        if !timeout.is_zero() {
            let shared = self.shared.clone();
            *self.timeout_task.lock() = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if *shared.state_tx.borrow() != StreamState::Stopped {
                    *shared.last_error.lock() = Some(Status::cancelled("stream timeout elapsed"));
                    let _ = shared.state_tx.send(StreamState::Stopped);
                }
            }));
        }
    }

    pub fn pause(&self) {
        if self.state() == StreamState::Running {
            let _ = self.shared.state_tx.send(StreamState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.state() == StreamState::Paused {
            let _ = self.shared.state_tx.send(StreamState::Running);
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let state_rx = self.state_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.config.streaming.pull_interval).await;
                match *state_rx.borrow() {
                    StreamState::Stopping | StreamState::Stopped => break,
                    StreamState::Paused => continue,
                    _ => {}
                }

                let allow_excess = shared.config.flow_control.allow_excess_messages;
                let mut used_batch_bypass = false;
                let mut max_pull = shared
                    .config
                    .streaming
                    .max_pull_size
                    .min(shared.flow_control.remaining_message_capacity());
                if max_pull == 0 {
                    if allow_excess {
                        shared.flow_control.start_batch_pull();
                        used_batch_bypass = true;
                        max_pull = shared.config.streaming.max_pull_size;
                    } else {
                        continue;
                    }
                }

                let pulled = shared.broker.pull(&shared.subscription, max_pull);
                if used_batch_bypass {
                    shared.flow_control.end_batch_pull();
                }
                match pulled {
                    Ok(batch) => {
                        let handler = shared.handler.lock().clone();
                        if let Some(handler) = handler {
                            for (ack_id, message) in batch {
                                dispatch_or_hold(&shared, &handler, ack_id, message);
                            }
                        }
                    }
                    Err(status) => {
                        *shared.last_error.lock() = Some(status);
                        let _ = shared.state_tx.send(StreamState::Stopped);
                        break;
                    }
                }
            }
        })
    }

    /// Begins Stopping; drains currently-dispatched deliveries per
    /// `closeOptions.behavior`, then transitions to Stopped.
    pub async fn stop(&self) {
        let _ = self.shared.state_tx.send(StreamState::Stopping);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }

        match self.shared.config.close.behavior {
            CloseBehavior::Wait => {
                let deadline = tokio::time::Instant::now() + self.shared.config.close.timeout;
                while !self.shared.dispatched.lock().is_empty() {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            CloseBehavior::Nack => {
                let ack_ids: Vec<String> = self.shared.dispatched.lock().keys().cloned().collect();
                for ack_id in ack_ids {
                    if let Err(status) = self.shared.broker.nack(&ack_id) {
                        if status.code() == Code::InvalidArgument {
                            tracing::warn!(ack_id, "lease already expired during stream stop");
                        } else {
                            tracing::error!(ack_id, %status, "error nacking message during stream stop");
                        }
                    }
                }
            }
        }

        self.shared.lease_manager.clear();
        self.shared.ack_manager.close();
        self.shared.dispatched.lock().clear();
        {
            let mut ordering = self.shared.ordering.lock();
            ordering.held.clear();
            ordering.in_dispatch.clear();
        }
        let _ = self.shared.state_tx.send(StreamState::Stopped);
    }
}

fn dispatch_or_hold(shared: &Arc<Shared>, handler: &Handler, ack_id: String, message: Message) {
    shared.flow_control.add_message(message.length());
    shared.lease_manager.add_lease(ack_id.clone());
    shared.dispatched.lock().insert(
        ack_id.clone(),
        DispatchedInfo { bytes: message.length(), ordering_key: message.ordering_key.clone() },
    );

    if shared.config.enable_message_ordering {
        if let Some(key) = message.ordering_key.clone() {
            let mut ordering = shared.ordering.lock();
            if ordering.in_dispatch.contains(&key) {
                ordering.held.entry(key).or_default().push_back((ack_id, message));
                return;
            }
            ordering.in_dispatch.insert(key);
        }
    }
    spawn_dispatch(shared.clone(), handler.clone(), ack_id, message);
}

fn spawn_dispatch(shared: Arc<Shared>, handler: Handler, ack_id: String, message: Message) {
    tokio::spawn(async move {
        let received = ReceivedMessage { message, ack_id, shared };
        handler(received).await;
    });
}
