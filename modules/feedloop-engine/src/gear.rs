//! Gear: a broadcast relay that lets otherwise unrelated loops exchange
//! events.
//!
//! A gear knows nothing about the loops around it. Loops reach it through
//! [`Feedback::attach`](crate::Feedback::attach) (gear event → loop event)
//! and [`Feedback::publish`](crate::Feedback::publish) (loop state → gear
//! event). The gear only holds the sending half of a broadcast channel, so
//! it never keeps a loop alive.

use futures::stream::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::config::{EngineConfig, DEFAULT_GEAR_CAPACITY};
use crate::stream::ValueStream;

/// Broadcast relay for events of type `G`. Clones share the same channel.
#[derive(Clone)]
pub struct Gear<G> {
    sender: broadcast::Sender<G>,
}

impl<G: Clone + Send + 'static> Gear<G> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GEAR_CAPACITY)
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self::with_capacity(config.gear_capacity)
    }

    /// A gear buffering up to `capacity` events per listener. A listener
    /// that falls further behind loses the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send `event` to every listener attached right now. Returns how many
    /// listeners it reached. Nothing is buffered for later listeners.
    pub fn propagate(&self, event: G) -> usize {
        match self.sender.send(event) {
            Ok(listeners) => {
                trace!(listeners, "Propagated gear event");
                listeners
            }
            Err(_) => {
                trace!("Gear event dropped; no listeners attached");
                0
            }
        }
    }

    /// Attach a new listener. It receives every event propagated from this
    /// call on.
    pub fn event_stream(&self) -> ValueStream<G> {
        let mut receiver = self.sender.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Gear listener lagged; oldest events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<G: Clone + Send + 'static> Default for Gear<G> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn propagate_without_listeners_reaches_nobody() {
        let gear = Gear::new();
        assert_eq!(gear.propagate("lost"), 0);
        assert_eq!(gear.listener_count(), 0);
    }

    #[tokio::test]
    async fn listeners_detach_when_stream_dropped() {
        let gear: Gear<u8> = Gear::new();
        let stream = gear.event_stream();
        assert_eq!(gear.listener_count(), 1);
        drop(stream);
        assert_eq!(gear.listener_count(), 0);
    }

    #[tokio::test]
    async fn every_listener_gets_each_event() {
        let gear = Gear::new();
        let a = gear.event_stream();
        let b = gear.event_stream();

        assert_eq!(gear.propagate(7), 2);
        drop(gear);

        let a: Vec<i32> = a.collect().await;
        let b: Vec<i32> = b.collect().await;
        assert_eq!(a, vec![7]);
        assert_eq!(b, vec![7]);
    }

    #[tokio::test]
    async fn lagging_listener_skips_oldest_events() {
        let gear = Gear::with_capacity(2);
        let listener = gear.event_stream();
        for n in 0..5 {
            gear.propagate(n);
        }
        drop(gear);

        let seen: Vec<i32> = listener.collect().await;
        assert_eq!(seen, vec![3, 4]);
    }
}
