// Per-resource serialization for streamed and external edits.
//
// `ThrottledSequencer` paces the batches into one resource: every batch takes at
// least `min_interval`, unless the queue is so deep that pacing it would add
// more than `max_overall_delay` in total.
//
// `KeyedLocks` hands out one FIFO lock per key (a resource URI or path).
// A key is listed by `keys()` while anyone holds or waits on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::config::StreamingConfig;

// ── Throttle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ThrottledSequencer {
    min_interval: Duration,
    max_overall_delay: Duration,
    size: Arc<AtomicUsize>,
}

impl ThrottledSequencer {
    pub fn new(min_interval: Duration, max_overall_delay: Duration) -> Self {
        Self { min_interval, max_overall_delay, size: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.min_edit_interval(), config.max_overall_delay())
    }

    /// Registers a queued batch and returns the minimum time it must take.
    pub fn admit(&self) -> Duration {
        let size = self.size.fetch_add(1, Ordering::SeqCst) + 1;
        let size = u32::try_from(size).unwrap_or(u32::MAX);
        if self.min_interval.saturating_mul(size) > self.max_overall_delay {
            Duration::ZERO
        } else {
            self.min_interval
        }
    }

    /// Marks one admitted batch as finished.
    pub fn finish(&self) {
        let _ = self.size.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn pending(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

// ── Keyed locks ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Membership of one holder or waiter in a key's slot.
#[derive(Debug)]
struct Ticket {
    key: String,
    locks: KeyedLocks,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = self.locks.slots();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    // Unlock before leaving the slot.
    _guard: OwnedMutexGuard<()>,
    ticket: Ticket,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.ticket.key
    }
}

impl KeyedLocks {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for every earlier holder of `key`, then holds it.
    pub async fn lock(&self, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let lock = {
            let mut slots = self.slots();
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| Slot { lock: Arc::new(tokio::sync::Mutex::new(())), holders: 0 });
            slot.holders += 1;
            slot.lock.clone()
        };
        let ticket = Ticket { key, locks: self.clone() };
        let guard = lock.lock_owned().await;
        KeyedGuard { _guard: guard, ticket }
    }

    /// Waits until everyone currently holding or queued on `key` is done.
    pub async fn peek(&self, key: &str) {
        let lock = self.slots().get(key).map(|slot| slot.lock.clone());
        if let Some(lock) = lock {
            drop(lock.lock().await);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.slots().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn throttle_stops_delaying_when_queue_backs_up() {
        let sequencer =
            ThrottledSequencer::new(Duration::from_millis(15), Duration::from_millis(1_000));
        let mut delays = Vec::new();
        for _ in 0..70 {
            delays.push(sequencer.admit());
        }
        // 66 * 15ms = 990ms still fits the budget; 67 * 15ms does not.
        assert_eq!(delays[65], Duration::from_millis(15));
        assert_eq!(delays[66], Duration::ZERO);
        assert_eq!(sequencer.pending(), 70);

        for _ in 0..70 {
            sequencer.finish();
        }
        sequencer.finish();
        assert_eq!(sequencer.pending(), 0);
        assert_eq!(sequencer.admit(), Duration::from_millis(15));
    }

    #[test]
    fn throttle_reads_streaming_config() {
        let sequencer = ThrottledSequencer::from_config(&StreamingConfig::default());
        assert_eq!(sequencer.admit(), Duration::from_millis(15));
    }

    #[tokio::test]
    async fn keys_are_listed_while_held() {
        let locks = KeyedLocks::default();
        assert!(locks.keys().is_empty());

        let guard = locks.lock("file:///a.txt").await;
        assert_eq!(guard.key(), "file:///a.txt");
        assert!(locks.is_held("file:///a.txt"));
        assert_eq!(locks.keys(), vec!["file:///a.txt".to_string()]);

        drop(guard);
        assert!(!locks.is_held("file:///a.txt"));
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::default();
        let first = locks.lock("k").await;
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let locks = locks.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let _second = locks.lock("k").await;
                assert!(released.load(Ordering::SeqCst));
            })
        };
        tokio::task::yield_now().await;
        released.store(true, Ordering::SeqCst);
        drop(first);
        waiter.await.unwrap();
        assert!(locks.keys().is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::default();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        let mut keys = locks.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn peek_waits_for_current_holder() {
        let locks = KeyedLocks::default();
        locks.peek("missing").await;

        let guard = locks.lock("k").await;
        let peeked = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.peek("k").await })
        };
        tokio::task::yield_now().await;
        assert!(!peeked.is_finished());
        drop(guard);
        peeked.await.unwrap();
    }
}
