//! The cold multicast primitive used throughout the registry and IO-state
//! items (`spec.md` §9, design notes): subscribe (lazily triggers a
//! publisher on first attachment), unsubscribe (triggers cleanup on last
//! detachment), and dispatch (fan out in reverse order).
//!
//! Modeled on the reference DDS crate's `sync_status_channel` /
//! `StatusEvented` status-event mechanism: a mutex-protected subscriber
//! list plus waker registration, exposed as a [`futures::Stream`]
//! implementor, rather than a full reactive-streams dependency.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::stream::{FusedStream, Stream};

struct Slot<T> {
    buffer: VecDeque<T>,
    waker: Option<Waker>,
    closed: bool,
}

struct Shared<T> {
    slots: Vec<Arc<Mutex<Slot<T>>>>,
    on_empty: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// A single subscriber's handle onto a [`Multicast`]'s fan-out.
pub struct Subscription<T> {
    slot: Arc<Mutex<Slot<T>>>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut guard = self.slot.lock().unwrap();
        if let Some(item) = guard.buffer.pop_front() {
            return Poll::Ready(Some(item));
        }
        if guard.closed {
            return Poll::Ready(None);
        }
        guard.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool {
        let guard = self.slot.lock().unwrap();
        guard.closed && guard.buffer.is_empty()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.slots.retain(|s| !Arc::ptr_eq(s, &self.slot));
        let became_empty = shared.slots.is_empty();
        let on_empty = if became_empty { shared.on_empty.take() } else { None };
        drop(shared);
        if let Some(cb) = on_empty {
            cb();
        }
    }
}

/// A cold multicast sink: fan-out point with reference-counted
/// subscribers. Owners call [`Multicast::emit`] to push an item to every
/// live subscriber, in reverse subscription order so a subscriber that
/// unsubscribes inside its own callback does not skip the next one.
pub struct Multicast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Multicast {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Multicast<T> {
    pub fn new() -> Self {
        Multicast {
            shared: Arc::new(Mutex::new(Shared {
                slots: Vec::new(),
                on_empty: None,
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().unwrap().slots.len()
    }

    /// Adds a subscriber. `on_first` is called exactly when this is the
    /// first subscriber to attach (lazy publication, §4.4). `on_empty`
    /// (re-registered on every call, last write wins) is called exactly
    /// when the subscriber count drops back to zero (§4.4 teardown).
    pub fn subscribe(
        &self,
        on_first: impl FnOnce(),
        on_empty: impl Fn() + Send + Sync + 'static,
    ) -> Subscription<T> {
        let slot = Arc::new(Mutex::new(Slot {
            buffer: VecDeque::new(),
            waker: None,
            closed: false,
        }));
        let mut shared_guard = self.shared.lock().unwrap();
        let is_first = shared_guard.slots.is_empty();
        shared_guard.slots.push(slot.clone());
        shared_guard.on_empty = Some(Arc::new(on_empty));
        drop(shared_guard);
        if is_first {
            on_first();
        }
        Subscription {
            slot,
            shared: self.shared.clone(),
        }
    }

    /// Fans `item` out to every live subscriber, most-recently-subscribed
    /// first.
    pub fn emit(&self, item: T)
    where
        T: Clone,
    {
        let shared = self.shared.lock().unwrap();
        for slot in shared.slots.iter().rev() {
            let mut guard = slot.lock().unwrap();
            guard.buffer.push_back(item.clone());
            if let Some(w) = guard.waker.take() {
                w.wake();
            }
        }
    }

    /// Closes every live subscriber's stream (no further items, `poll_next`
    /// returns `None` once drained).
    pub fn close(&self) {
        let shared = self.shared.lock().unwrap();
        for slot in shared.slots.iter() {
            let mut guard = slot.lock().unwrap();
            guard.closed = true;
            if let Some(w) = guard.waker.take() {
                w.wake();
            }
        }
    }
}

/// Behavior-subject semantics for IO-state items (§3, §4.6, P8): always
/// remembers the most recent value and replays it to new subscribers.
pub struct BehaviorMulticast<T: Clone> {
    multicast: Multicast<T>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> Default for BehaviorMulticast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BehaviorMulticast<T> {
    pub fn new() -> Self {
        BehaviorMulticast {
            multicast: Multicast::new(),
            last: Mutex::new(None),
        }
    }

    pub fn emit(&self, item: T) {
        *self.last.lock().unwrap() = Some(item.clone());
        self.multicast.emit(item);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let sub = self.multicast.subscribe(|| {}, || {});
        if let Some(last) = self.last.lock().unwrap().clone() {
            // Replay the current state immediately so a fresh subscriber
            // sees it before any future transition (P8).
            let mut guard = sub.slot.lock().unwrap();
            guard.buffer.push_front(last);
        }
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn lazy_publish_fires_on_first_subscriber_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mc: Multicast<i32> = Multicast::new();
        let c1 = calls.clone();
        let _s1 = mc.subscribe(
            move || {
                c1.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        let c2 = calls.clone();
        let _s2 = mc.subscribe(
            move || {
                c2.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_fires_only_on_last_unsubscribe() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mc: Multicast<i32> = Multicast::new();
        let c = cleaned.clone();
        let s1 = mc.subscribe(|| {}, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = cleaned.clone();
        let s2 = mc.subscribe(|| {}, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        drop(s1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
        drop(s2);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_delivers_to_subscriber() {
        let mc: Multicast<i32> = Multicast::new();
        let mut s = mc.subscribe(|| {}, || {});
        mc.emit(42);
        let got = block_on(s.next());
        assert_eq!(got, Some(42));
    }

    #[test]
    fn behavior_multicast_replays_last_state() {
        let bm: BehaviorMulticast<bool> = BehaviorMulticast::new();
        bm.emit(true);
        let mut s = bm.subscribe();
        let got = block_on(s.next());
        assert_eq!(got, Some(true));
    }
}
