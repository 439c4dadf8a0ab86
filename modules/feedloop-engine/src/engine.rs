//! The feedback loop.
//!
//! State → feedbacks → merged events → reducer → state, round and round.
//! The state stream is both the reducer's output and every feedback's
//! input, so the graph is built lazily, once per subscription, around a
//! [`StateRelay`] that closes the cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::context::{ContextFactory, ExecutionContext};
use crate::feedback::Feedback;
use crate::reducer::Reducer;
use crate::relay::StateRelay;
use crate::stream::ValueStream;

/// An assembled loop: initial state, feedbacks, and one reducer.
///
/// Holding a `Loop` is cheap; nothing runs until [`Loop::stream`] is polled
/// or the loop is started. Every run gets its own relay, so two runs of
/// the same `Loop` never share state.
pub struct Loop<S, E> {
    pub(crate) initial: S,
    pub(crate) feedbacks: Vec<Feedback<S, E>>,
    pub(crate) reducer: Reducer<S, E>,
    pub(crate) context: Option<ExecutionContext>,
    pub(crate) context_factory: Option<ContextFactory>,
    pub(crate) started: AtomicBool,
}

impl<S, E> Loop<S, E>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new(initial: S, feedbacks: Vec<Feedback<S, E>>, reducer: Reducer<S, E>) -> Self {
        Self {
            initial,
            feedbacks,
            reducer,
            context: None,
            context_factory: None,
            started: AtomicBool::new(false),
        }
    }

    pub fn initial_state(&self) -> &S {
        &self.initial
    }

    pub fn feedback_count(&self) -> usize {
        self.feedbacks.len()
    }

    /// The loop's state stream. The first value is always the initial
    /// state; every later one is the result of folding one event.
    ///
    /// Each call is an independent run. Dropping the stream cancels the
    /// reducer and every in-flight effect.
    pub fn stream(&self) -> ValueStream<S> {
        self.started.store(true, Ordering::SeqCst);

        let initial = self.initial.clone();
        let feedbacks = self.feedbacks.clone();
        let reducer = self.reducer.clone();

        stream::once(future::lazy(move |_| build_cycle(initial, feedbacks, reducer)))
            .flatten()
            .boxed()
    }

    /// Wire a run right away instead of on first poll. Gear listeners are
    /// attached and effect tasks are spawned by the time this returns.
    pub(crate) fn build_now(&self) -> ValueStream<S> {
        self.started.store(true, Ordering::SeqCst);
        build_cycle(
            self.initial.clone(),
            self.feedbacks.clone(),
            self.reducer.clone(),
        )
    }
}

/// Wire one run of the loop.
///
/// Feedback inputs are attached to the relay before the reducer's output
/// is polled, so every feedback reads the initial state first. The relay
/// is then fed from the reducer's output, seed included, which is what
/// closes the cycle.
fn build_cycle<S, E>(
    initial: S,
    feedbacks: Vec<Feedback<S, E>>,
    reducer: Reducer<S, E>,
) -> ValueStream<S>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    let relay = StateRelay::new();
    let branches: Vec<ValueStream<E>> = feedbacks
        .iter()
        .flat_map(|feedback| feedback.run_on(&relay))
        .collect();

    debug!(
        feedbacks = feedbacks.len(),
        branches = branches.len(),
        reducer_context = reducer.context().name(),
        "Building feedback loop"
    );

    let events = stream::select_all(branches).boxed();
    reducer
        .apply(initial, events)
        .inspect(move |state| relay.feed(state.clone()))
        .boxed()
}

impl<S, E> fmt::Debug for Loop<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("feedbacks", &self.feedbacks)
            .field("reducer", &self.reducer)
            .field("context", &self.context)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
