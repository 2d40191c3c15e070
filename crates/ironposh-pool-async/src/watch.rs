use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{StreamExt, channel::mpsc};

use crate::StateStream;

struct WatchInner<T> {
    value: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// Holds the latest value of a piece of state and fans every change out to
/// its subscribers. A new subscriber always receives the current value first,
/// so nobody can miss the initial state.
pub struct StateWatch<T> {
    inner: Arc<Mutex<WatchInner<T>>>,
}

impl<T> Clone for StateWatch<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> StateWatch<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WatchInner {
                value: initial,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Stores `value` and notifies subscribers. Returns `false` when the value
    /// did not change.
    pub fn set(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.value == value {
            return false;
        }

        inner.value = value;
        let WatchInner { value, subscribers } = &mut *inner;
        subscribers.retain(|tx| tx.unbounded_send(value.clone()).is_ok());
        true
    }

    pub fn subscribe(&self) -> StateStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.lock();
        // the receiver is alive, this cannot fail
        let _ = tx.unbounded_send(inner.value.clone());
        inner.subscribers.push(tx);
        rx.boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}
