//! Publisher- and subscriber-side flow control.
//!
//! Both gates are intentionally separate types: the publisher gate blocks the
//! caller until room is available (an admission queue, FIFO over waiters);
//! the subscriber gate never blocks — it answers "is there room" so a pull
//! worker can throttle how much it asks the broker for.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Defaults: 100 outstanding messages, 1 MiB outstanding bytes.
#[derive(Clone, Copy, Debug)]
pub struct PublisherFlowControlConfig {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
}

impl Default for PublisherFlowControlConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 100,
            max_outstanding_bytes: 1_048_576,
        }
    }
}

struct Waiter {
    bytes: usize,
    done: oneshot::Sender<()>,
}

struct Inner {
    outstanding_messages: usize,
    outstanding_bytes: usize,
    waiters: VecDeque<Waiter>,
}

/// Admission gate on a topic's outstanding publish load.
pub struct PublisherFlowControl {
    config: PublisherFlowControlConfig,
    inner: Mutex<Inner>,
}

impl PublisherFlowControl {
    pub fn new(config: PublisherFlowControlConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                outstanding_messages: 0,
                outstanding_bytes: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn fits(&self, inner: &Inner, bytes: usize) -> bool {
        inner.outstanding_messages < self.config.max_outstanding_messages
            && inner.outstanding_bytes + bytes <= self.config.max_outstanding_bytes
    }

    /// Suspends the caller until the message can be admitted, then accounts
    /// it. A caller that is admitted has a corresponding obligation to call
    /// [`Self::release`] once the message leaves outstanding state.
    pub async fn acquire(&self, bytes: usize) {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() && self.fits(&inner, bytes) {
                inner.outstanding_messages += 1;
                inner.outstanding_bytes += bytes;
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { bytes, done: tx });
            rx
        };
        // The waiter that pops us off the queue already performed our
        // accounting before waking us, so there's nothing left to do here.
        let _ = rx.await;
    }

    /// Releases `bytes` of outstanding accounting and wakes FIFO-eligible
    /// waiters whose request now fits.
    pub fn release(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.outstanding_messages = inner.outstanding_messages.saturating_sub(1);
        inner.outstanding_bytes = inner.outstanding_bytes.saturating_sub(bytes);
        while let Some(front) = inner.waiters.front() {
            if self.fits(&inner, front.bytes) {
                let waiter = inner.waiters.pop_front().unwrap();
                inner.outstanding_messages += 1;
                inner.outstanding_bytes += waiter.bytes;
                let _ = waiter.done.send(());
            } else {
                break;
            }
        }
    }

    pub fn outstanding_messages(&self) -> usize {
        self.inner.lock().outstanding_messages
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.inner.lock().outstanding_bytes
    }
}

/// Defaults: 1000 messages, 100 MiB, excess tolerance off.
#[derive(Clone, Copy, Debug)]
pub struct SubscriberFlowControlConfig {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub allow_excess_messages: bool,
}

impl Default for SubscriberFlowControlConfig {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_bytes: 104_857_600,
            allow_excess_messages: false,
        }
    }
}

struct SubState {
    messages: usize,
    bytes: usize,
    batch_depth: u32,
}

/// Non-blocking inflight counter used by a `MessageStream` pull worker to
/// decide how much to ask the broker for.
pub struct SubscriberFlowControl {
    config: SubscriberFlowControlConfig,
    state: Mutex<SubState>,
}

impl SubscriberFlowControl {
    pub fn new(config: SubscriberFlowControlConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SubState {
                messages: 0,
                bytes: 0,
                batch_depth: 0,
            }),
        }
    }

    /// Whether one more message of `bytes` could be accepted right now.
    pub fn can_accept(&self, bytes: usize) -> bool {
        let state = self.state.lock();
        if self.config.allow_excess_messages && state.batch_depth > 0 {
            return true;
        }
        state.messages < self.config.max_messages && state.bytes + bytes <= self.config.max_bytes
    }

    pub fn add_message(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.messages += 1;
        state.bytes += bytes;
    }

    pub fn remove_message(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.messages = state.messages.saturating_sub(1);
        state.bytes = state.bytes.saturating_sub(bytes);
    }

    /// Marks the start of a pull that is allowed to overshoot the limits in
    /// excess mode; must be paired with [`Self::end_batch_pull`].
    pub fn start_batch_pull(&self) {
        self.state.lock().batch_depth += 1;
    }

    pub fn end_batch_pull(&self) {
        let mut state = self.state.lock();
        state.batch_depth = state.batch_depth.saturating_sub(1);
    }

    /// Remaining message admission capacity, ignoring excess-mode overrides.
    pub fn remaining_message_capacity(&self) -> usize {
        let state = self.state.lock();
        self.config.max_messages.saturating_sub(state.messages)
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages
    }

    pub fn allow_excess_messages(&self) -> bool {
        self.config.allow_excess_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_flow_control_admits_under_limit() {
        let fc = PublisherFlowControl::new(PublisherFlowControlConfig {
            max_outstanding_messages: 2,
            max_outstanding_bytes: 1024,
        });
        fc.acquire(10).await;
        fc.acquire(10).await;
        assert_eq!(fc.outstanding_messages(), 2);
    }

    #[tokio::test]
    async fn publisher_flow_control_releases_fifo_waiter() {
        let fc = std::sync::Arc::new(PublisherFlowControl::new(PublisherFlowControlConfig {
            max_outstanding_messages: 1,
            max_outstanding_bytes: 1024,
        }));
        fc.acquire(10).await;

        let fc2 = fc.clone();
        let waiter = tokio::spawn(async move {
            fc2.acquire(10).await;
        });
        // Give the waiter a chance to enqueue before releasing.
        tokio::task::yield_now().await;
        fc.release(10);
        waiter.await.unwrap();
        assert_eq!(fc.outstanding_messages(), 1);
    }

    #[test]
    fn subscriber_flow_control_strict_mode_rejects_over_limit() {
        let fc = SubscriberFlowControl::new(SubscriberFlowControlConfig {
            max_messages: 1,
            max_bytes: 1024,
            allow_excess_messages: false,
        });
        assert!(fc.can_accept(10));
        fc.add_message(10);
        assert!(!fc.can_accept(10));
    }

    #[test]
    fn subscriber_flow_control_excess_mode_bypasses_during_batch() {
        let fc = SubscriberFlowControl::new(SubscriberFlowControlConfig {
            max_messages: 1,
            max_bytes: 1024,
            allow_excess_messages: true,
        });
        fc.add_message(10);
        assert!(!fc.can_accept(10));
        fc.start_batch_pull();
        assert!(fc.can_accept(10));
        fc.end_batch_pull();
        assert!(!fc.can_accept(10));
    }
}
