//! Building and running loops.
//!
//! [`LoopBuilder`] assembles a [`Loop`] from its parts; `Loop::start*`
//! drive it from a task and hand back a [`Subscription`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::context::{ContextFactory, ExecutionContext};
use crate::engine::Loop;
use crate::error::{LoopError, Result};
use crate::feedback::Feedback;
use crate::reducer::Reducer;
use crate::stream::Subscription;

/// How often an idle observed loop checks whether its observer is gone.
const OBSERVER_CHECK_PERIOD: Duration = Duration::from_millis(250);

/// Chained construction of a [`Loop`].
///
/// ```ignore
/// let counter = LoopBuilder::new(0)
///     .with_feedback(Feedback::triggered(|| stream::just(1)))
///     .with_reducer(Reducer::new(|n: u32, by: u32| n + by, context))
///     .build()?;
/// ```
pub struct LoopBuilder<S, E> {
    initial: S,
    feedbacks: Vec<Feedback<S, E>>,
    reducer: Option<Reducer<S, E>>,
    context: Option<ExecutionContext>,
    context_factory: Option<ContextFactory>,
}

impl<S, E> LoopBuilder<S, E>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            feedbacks: Vec::new(),
            reducer: None,
            context: None,
            context_factory: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Feedback<S, E>) -> Self {
        self.feedbacks.push(feedback);
        self
    }

    pub fn with_feedbacks(mut self, feedbacks: impl IntoIterator<Item = Feedback<S, E>>) -> Self {
        self.feedbacks.extend(feedbacks);
        self
    }

    /// Set the reducer. A later call replaces an earlier one.
    pub fn with_reducer(mut self, reducer: Reducer<S, E>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    /// Context the driving task runs on when the loop is started.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Produces the driving context when none was set with
    /// [`with_context`](Self::with_context).
    pub fn with_context_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<ExecutionContext> + Send + Sync + 'static,
    {
        self.context_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<Loop<S, E>> {
        let reducer = self.reducer.ok_or(LoopError::MissingReducer)?;
        let mut assembled = Loop::new(self.initial, self.feedbacks, reducer);
        assembled.context = self.context;
        assembled.context_factory = self.context_factory;
        Ok(assembled)
    }
}

impl<S, E> Loop<S, E>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Append a feedback. Rejected once the loop has been started.
    pub fn add_feedback(&mut self, feedback: Feedback<S, E>) -> Result<()> {
        if self.is_started() {
            return Err(LoopError::AlreadyStarted);
        }
        self.feedbacks.push(feedback);
        Ok(())
    }

    /// True once the loop has been started or its stream requested.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the loop in the background, discarding its states.
    pub fn start(&self) -> Result<Subscription> {
        self.start_with(|_| {})
    }

    /// Run the loop in the background, handing each state to `on_state`.
    ///
    /// The run is wired before this returns: gear listeners are attached,
    /// so an event propagated right after `start_with` reaches the loop.
    pub fn start_with<F>(&self, mut on_state: F) -> Result<Subscription>
    where
        F: FnMut(S) + Send + 'static,
    {
        let context = self.driving_context()?;
        let run_id = Uuid::new_v4();
        let mut states = self.build_now();

        let task = context.spawn(
            async move {
                debug!("Loop started");
                while let Some(state) = states.next().await {
                    on_state(state);
                }
                debug!("Loop completed");
            }
            .instrument(info_span!("loop", %run_id)),
        );
        Ok(Subscription::new(run_id, task.abort_handle()))
    }

    /// Run the loop, rendering each state into `observer` without keeping
    /// it alive. The run stops on its own once the observer is dropped,
    /// whether or not new states keep arriving.
    pub fn start_observing<O, R>(&self, observer: &Arc<O>, render: R) -> Result<Subscription>
    where
        O: Send + Sync + 'static,
        R: Fn(&O, S) + Send + 'static,
    {
        let observer: Weak<O> = Arc::downgrade(observer);
        let context = self.driving_context()?;
        let run_id = Uuid::new_v4();
        let mut states = self.build_now();

        let task = context.spawn(
            async move {
                let mut liveness = tokio::time::interval(OBSERVER_CHECK_PERIOD);
                liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        next = states.next() => {
                            let Some(state) = next else { return };
                            let Some(observer) = observer.upgrade() else {
                                debug!("Observer dropped; stopping loop");
                                return;
                            };
                            render(&observer, state);
                        }
                        _ = liveness.tick() => {
                            if observer.strong_count() == 0 {
                                debug!("Observer dropped while idle; stopping loop");
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("loop", %run_id)),
        );
        Ok(Subscription::new(run_id, task.abort_handle()))
    }

    /// Stop a run started from this loop.
    pub fn stop(&self, subscription: Subscription) {
        debug!(run_id = %subscription.id(), "Stopping loop");
        subscription.cancel();
    }

    fn driving_context(&self) -> Result<ExecutionContext> {
        match (&self.context, &self.context_factory) {
            (Some(context), _) => Ok(context.clone()),
            (None, Some(factory)) => factory(),
            (None, None) => ExecutionContext::current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;

    fn summing_reducer() -> Reducer<u32, u32> {
        Reducer::new(|n, by| n + by, ExecutionContext::current().unwrap())
    }

    #[tokio::test]
    async fn build_without_reducer_fails() {
        let result = LoopBuilder::<u32, u32>::new(0).build();
        assert!(matches!(result, Err(LoopError::MissingReducer)));
    }

    #[tokio::test]
    async fn feedbacks_are_frozen_after_start() {
        let mut counter = LoopBuilder::new(0)
            .with_reducer(summing_reducer())
            .build()
            .unwrap();
        counter
            .add_feedback(Feedback::triggered(|| stream::just(1)))
            .unwrap();

        let _run = counter.start().unwrap();

        let result = counter.add_feedback(Feedback::triggered(|| stream::just(2)));
        assert!(matches!(result, Err(LoopError::AlreadyStarted)));
        assert_eq!(counter.feedback_count(), 1);
    }

    #[tokio::test]
    async fn context_factory_is_used_when_no_context_given() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let counter = LoopBuilder::new(0)
            .with_reducer(summing_reducer())
            .with_context_factory(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                ExecutionContext::current()
            })
            .build()
            .unwrap();

        let _run = counter.start().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
