//! Typed listener channels.
//!
//! A [`Signal`] is owned by the component that emits it. Listeners connect
//! with a closure and receive a [`Subscription`]; dropping or disconnecting
//! the subscription removes the listener. Emission snapshots the listener list
//! and calls it without holding the lock, so listeners may connect,
//! disconnect or emit re-entrantly.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    slots: Vec<(u64, Slot<T>)>,
}

/// A typed event channel with explicit subscribe/unsubscribe.
pub struct Signal<T> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> Signal<T> {
    /// Creates a signal with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Connects a listener. It stays connected while the returned
    /// subscription is alive.
    #[must_use = "dropping the subscription disconnects the listener"]
    pub fn connect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.slots.push((id, Arc::new(listener)));
            id
        };
        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            disconnect: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().unwrap().slots.retain(|(slot, _)| *slot != id);
                }
            })),
        }
    }

    /// Calls every connected listener in connection order.
    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = self
            .inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in slots {
            slot(value);
        }
    }

    /// Number of connected listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}

/// Keeps a listener connected to its [`Signal`].
pub struct Subscription {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Disconnects the listener now.
    pub fn disconnect(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_connected_listeners() {
        let signal = Signal::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t = total.clone();
        let _sub = signal.connect(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        signal.emit(&3);
        signal.emit(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn dropping_subscription_disconnects() {
        let signal = Signal::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(signal.listener_count(), 1);
        drop(sub);
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn subscription_outliving_signal_is_harmless() {
        let signal = Signal::<()>::new();
        let sub = signal.connect(|_| {});
        drop(signal);
        sub.disconnect();
    }
}
