//! Keyed one-shot and periodic timers for the client's owner task.
//!
//! The registry is polled by the same task that cancels timers, so an
//! expiry and a cancellation can never interleave: once `cancel` (or a
//! re-arm of the same key) returns, that arming is gone from the queue and
//! `next_expired` cannot yield it.

use std::collections::HashMap;
use std::future::poll_fn;
use std::hash::Hash;
use std::time::Duration;

use tokio_util::time::{delay_queue, DelayQueue};

/// Timers armed by the event client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Heartbeat,
    Reconnect,
    /// Per-second countdown of one confirmation request.
    Countdown(String),
    /// Grace-period removal of a finished execution.
    Removal(String),
}

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Once,
    Every(Duration),
}

struct Armed {
    slot: delay_queue::Key,
    cadence: Cadence,
}

pub struct TimerRegistry<K> {
    queue: DelayQueue<K>,
    armed: HashMap<K, Armed>,
}

impl<K> TimerRegistry<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            armed: HashMap::new(),
        }
    }

    /// Arms `key` to fire once after `delay`, replacing any timer under the same key.
    pub fn schedule_once(&mut self, key: K, delay: Duration) {
        self.arm(key, delay, Cadence::Once);
    }

    /// Arms `key` to fire every `period`, first after one full period.
    pub fn schedule_every(&mut self, key: K, period: Duration) {
        self.arm(key, period, Cadence::Every(period));
    }

    fn arm(&mut self, key: K, delay: Duration, cadence: Cadence) {
        let _ = self.cancel(&key);
        let slot = self.queue.insert(key.clone(), delay);
        self.armed.insert(key, Armed { slot, cadence });
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(armed) => {
                let _ = self.queue.remove(&armed.slot);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.armed.len();
        self.armed.clear();
        self.queue.clear();
        cancelled
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Waits for the next expired key. Periodic timers are re-armed before
    /// their key is returned. Never resolves while nothing is armed.
    ///
    /// Cancel safe: an expiry is taken off the queue and bookkept in the same
    /// poll that returns it.
    pub async fn next_expired(&mut self) -> K {
        loop {
            if self.queue.is_empty() {
                std::future::pending::<()>().await;
            }
            let Some(expired) = poll_fn(|cx| self.queue.poll_expired(cx)).await else {
                continue;
            };
            let key = expired.into_inner();
            let Some(cadence) = self.armed.get(&key).map(|armed| armed.cadence) else {
                continue;
            };
            match cadence {
                Cadence::Once => {
                    self.armed.remove(&key);
                }
                Cadence::Every(period) => {
                    let slot = self.queue.insert(key.clone(), period);
                    if let Some(armed) = self.armed.get_mut(&key) {
                        armed.slot = slot;
                    }
                }
            }
            return key;
        }
    }
}

impl<K> Default for TimerRegistry<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
