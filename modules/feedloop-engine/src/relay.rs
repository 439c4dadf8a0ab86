//! Fan-out of loop states to every feedback input.

use std::sync::{Mutex, PoisonError};

use futures::channel::mpsc;
use futures::stream::StreamExt;
use tracing::trace;

use crate::stream::ValueStream;

/// Replays the latest state to new readers and pushes every later state to
/// all of them.
///
/// The loop engine is the only writer. Each reader gets its own unbounded
/// queue, so a slow feedback never makes another one miss a state.
pub(crate) struct StateRelay<S> {
    inner: Mutex<RelayInner<S>>,
}

struct RelayInner<S> {
    current: Option<S>,
    readers: Vec<mpsc::UnboundedSender<S>>,
}

impl<S: Clone + Send + 'static> StateRelay<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RelayInner {
                current: None,
                readers: Vec::new(),
            }),
        }
    }

    /// A new reader. Its first value is the latest state, if any.
    pub(crate) fn subscribe(&self) -> ValueStream<S> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = &inner.current {
            let _ = tx.unbounded_send(current.clone());
        }
        inner.readers.push(tx);
        rx.boxed()
    }

    /// Push a state to every live reader and remember it for late ones.
    pub(crate) fn feed(&self, state: S) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .readers
            .retain(|reader| reader.unbounded_send(state.clone()).is_ok());
        trace!(readers = inner.readers.len(), "Relayed state");
        inner.current = Some(state);
    }

    #[cfg(test)]
    fn reader_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .readers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_reader_starts_from_latest_state() {
        let relay = StateRelay::new();
        relay.feed(1);
        relay.feed(2);

        let reader = relay.subscribe();
        relay.feed(3);
        drop(relay);

        let seen: Vec<i32> = reader.collect().await;
        assert_eq!(seen, vec![2, 3]);
    }

    #[tokio::test]
    async fn every_reader_sees_every_state() {
        let relay = StateRelay::new();
        let a = relay.subscribe();
        let b = relay.subscribe();
        for n in 0..5 {
            relay.feed(n);
        }
        drop(relay);

        let a: Vec<i32> = a.collect().await;
        let b: Vec<i32> = b.collect().await;
        assert_eq!(a, vec![0, 1, 2, 3, 4]);
        assert_eq!(a, b);
    }

    #[test]
    fn dropped_readers_are_pruned() {
        let relay = StateRelay::new();
        let kept = relay.subscribe();
        drop(relay.subscribe());
        relay.feed("state");
        assert_eq!(relay.reader_count(), 1);
        drop(kept);
    }
}
