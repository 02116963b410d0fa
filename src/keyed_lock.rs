/// Keyed lock with a global-exclusive reorg mode
///
/// Fine-grained coordinator for per-transaction work: a holder owns its whole
/// key set atomically, callers whose sets intersect queue FIFO behind it, and
/// disjoint callers run concurrently. `acquire_reorg` drains every keyed
/// holder and blocks new keyed admissions until its guard drops; pending
/// reorgs take precedence over queued and newly arriving keyed waiters.
///
/// Key sets are acquired whole, never incrementally, so intersecting sets
/// cannot deadlock. Guards release on `Drop`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::types::Txid;

#[derive(Default)]
struct LockState {
    held: HashSet<Txid>,
    active: usize,
    reorg_active: bool,
    keyed_waiters: VecDeque<KeyedWaiter>,
    reorg_waiters: VecDeque<oneshot::Sender<()>>,
}

struct KeyedWaiter {
    keys: HashSet<Txid>,
    ready: oneshot::Sender<()>,
}

impl LockState {
    fn can_admit(&self, keys: &HashSet<Txid>) -> bool {
        if self.reorg_active || !self.reorg_waiters.is_empty() {
            return false;
        }
        if keys.iter().any(|k| self.held.contains(k)) {
            return false;
        }
        // A disjoint set may overtake the queue, but anything intersecting a
        // queued waiter goes behind it (FIFO per key).
        !self
            .keyed_waiters
            .iter()
            .any(|w| w.keys.iter().any(|k| keys.contains(k)))
    }

    fn admit(&mut self, keys: &HashSet<Txid>) {
        self.held.extend(keys.iter().copied());
        self.active += 1;
    }

    fn release_keys(&mut self, keys: &[Txid]) {
        for key in keys {
            self.held.remove(key);
        }
        self.active = self.active.saturating_sub(1);
    }

    /// Admission pass after any release: a pending reorg goes first once the
    /// keyed holders drain; otherwise scan keyed waiters in order, admitting
    /// each one disjoint from everything held or queued ahead of it.
    fn wake(&mut self) {
        if self.reorg_active {
            return;
        }

        if !self.reorg_waiters.is_empty() {
            if self.active == 0 {
                if let Some(ready) = self.reorg_waiters.pop_front() {
                    self.reorg_active = true;
                    if ready.send(()).is_err() {
                        // Caller went away before the grant landed
                        self.reorg_active = false;
                        self.wake();
                    }
                }
            }
            return;
        }

        let mut blocked: HashSet<Txid> = self.held.clone();
        let mut still_waiting = VecDeque::new();
        while let Some(waiter) = self.keyed_waiters.pop_front() {
            if waiter.keys.iter().any(|k| blocked.contains(k)) {
                blocked.extend(waiter.keys.iter().copied());
                still_waiting.push_back(waiter);
                continue;
            }
            blocked.extend(waiter.keys.iter().copied());
            self.held.extend(waiter.keys.iter().copied());
            self.active += 1;
            let keys = waiter.keys;
            if waiter.ready.send(()).is_err() {
                for key in &keys {
                    self.held.remove(key);
                }
                self.active = self.active.saturating_sub(1);
            }
        }
        self.keyed_waiters = still_waiting;
    }
}

#[derive(Clone, Default)]
pub struct KeyedLock {
    state: Arc<Mutex<LockState>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in `keys` atomically. The guard holds them all until
    /// it is dropped.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = Txid>) -> KeyedGuard {
        let keys: HashSet<Txid> = keys.into_iter().collect();
        let waiting = {
            let mut state = self.state.lock().unwrap();
            if state.can_admit(&keys) {
                state.admit(&keys);
                None
            } else {
                let (ready, rx) = oneshot::channel();
                state.keyed_waiters.push_back(KeyedWaiter {
                    keys: keys.clone(),
                    ready,
                });
                Some(rx)
            }
        };
        if let Some(rx) = waiting {
            let _ = rx.await;
        }
        KeyedGuard {
            state: Arc::clone(&self.state),
            keys: keys.into_iter().collect(),
        }
    }

    /// Acquire the lock in global-exclusive mode: waits for every keyed
    /// holder to finish and blocks new keyed callers until the guard drops.
    pub async fn acquire_reorg(&self) -> ReorgGuard {
        let waiting = {
            let mut state = self.state.lock().unwrap();
            if state.active == 0 && !state.reorg_active && state.reorg_waiters.is_empty() {
                state.reorg_active = true;
                None
            } else {
                let (ready, rx) = oneshot::channel();
                state.reorg_waiters.push_back(ready);
                Some(rx)
            }
        };
        if let Some(rx) = waiting {
            let _ = rx.await;
        }
        ReorgGuard {
            state: Arc::clone(&self.state),
        }
    }
}

pub struct KeyedGuard {
    state: Arc<Mutex<LockState>>,
    keys: Vec<Txid>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.release_keys(&self.keys);
        state.wake();
    }
}

pub struct ReorgGuard {
    state: Arc<Mutex<LockState>>,
}

impl Drop for ReorgGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.reorg_active = false;
        state.wake();
    }
}
