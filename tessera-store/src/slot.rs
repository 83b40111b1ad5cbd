//! Observer registry for workspace notification channels.
//!
//! A [`Slot`] is a named notification channel: subscribers register a
//! callback with [`Slot::on`] and receive every subsequent emission,
//! synchronously, in registration order. The subscriber list is snapshotted
//! before dispatch, so a subscriber registered during delivery does not
//! receive the in-flight emission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SlotInner<T> {
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// A synchronous, ordered notification channel.
///
/// Cloning a `Slot` yields another handle to the same channel.
pub struct Slot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a callback. The returned guard detaches it when dropped.
    pub fn on<F>(&self, callback: F) -> SlotSubscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        SlotSubscription {
            slot: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `value` to every currently registered subscriber.
    ///
    /// The subscriber list is snapshotted under the lock and released before
    /// any callback runs, so callbacks may register further subscribers or
    /// emit on other slots without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let subs = self.inner.subscribers.lock().unwrap();
            subs.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in snapshot {
            cb(value);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

/// RAII guard for a slot subscription. Dropping it detaches the callback.
pub struct SlotSubscription<T> {
    slot: Weak<SlotInner<T>>,
    id: u64,
}

impl<T> Drop for SlotSubscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.slot.upgrade() {
            let mut subs = inner.subscribers.lock().unwrap();
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}
