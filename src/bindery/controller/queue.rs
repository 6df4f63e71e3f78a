use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::bindery::api::types::ObjectKey;

/// De-duplicating FIFO of object keys.
///
/// A key that is already queued is not queued twice, so a burst of updates on
/// one object collapses into a single reconcile. Keys re-enqueued while a
/// worker is processing them are accepted again; level-based reconciliation
/// makes the extra pass harmless.
#[derive(Clone)]
pub struct KeyedQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    members: HashSet<ObjectKey>,
    closed: bool,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.closed {
            return;
        }
        if state.members.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Pops the next key, waiting if the queue is empty. Returns `None` once
    /// the queue has been closed and drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self
                    .inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(key) = state.pending.pop_front() {
                    state.members.remove(&key);
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyedQueue {
    fn default() -> Self {
        Self::new()
    }
}
