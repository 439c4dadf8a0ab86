//! Feedbacks: the effectful half of a loop.
//!
//! A feedback turns the loop's state stream into an event stream. Most are
//! built from a per-state effect (`State → events`) plus a
//! [`ConcurrencyStrategy`] that decides what happens when a new state
//! arrives before the previous effect has finished.
//!
//! A feedback may be a combination of several branches (see
//! [`Feedback::combine`]). Each branch keeps its own execution context and
//! strategy; the loop merges their outputs with no ordering across
//! branches, only FIFO within one.

use std::fmt::{self, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future;
use futures::stream::{self as futures_stream, StreamExt};
use tracing::warn;

use crate::context::ExecutionContext;
use crate::gear::Gear;
use crate::relay::StateRelay;
use crate::stream::{self, ValueStream};

/// What a feedback does with its in-flight effect when a new state arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyStrategy {
    /// Keep the previous effect running and merge both outputs.
    ContinueOnNewState,
    /// Drop the previous effect; only the newest one's events get through.
    #[default]
    CancelOnNewState,
}

type Effect<S, E> = Arc<dyn Fn(ValueStream<S>) -> ValueStream<E> + Send + Sync>;

struct Branch<S, E> {
    effect: Effect<S, E>,
    context: Option<ExecutionContext>,
}

impl<S, E> Clone for Branch<S, E> {
    fn clone(&self) -> Self {
        Self {
            effect: Arc::clone(&self.effect),
            context: self.context.clone(),
        }
    }
}

impl<S: Send + 'static, E: Send + 'static> Branch<S, E> {
    fn run(&self, states: ValueStream<S>) -> ValueStream<E> {
        // Setting the effect up may panic too, not only polling it.
        let events = match panic::catch_unwind(AssertUnwindSafe(|| (self.effect)(states))) {
            Ok(events) => stream::catch_panics(events),
            Err(payload) => {
                warn!(
                    panic = stream::panic_message(&*payload),
                    "Effect panicked while starting; dropping its branch"
                );
                stream::empty()
            }
        };
        match &self.context {
            Some(context) => context.observe_on(events),
            None => events,
        }
    }
}

/// Maps a stream of states to a stream of events.
pub struct Feedback<S, E> {
    branches: Vec<Branch<S, E>>,
}

impl<S, E> Clone for Feedback<S, E> {
    fn clone(&self) -> Self {
        Self {
            branches: self.branches.clone(),
        }
    }
}

impl<S, E> fmt::Debug for Feedback<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feedback")
            .field("branches", &self.branches.len())
            .field(
                "contexts",
                &self
                    .branches
                    .iter()
                    .map(|b| b.context.as_ref().map(ExecutionContext::name))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<S, E> Feedback<S, E>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Per-state effect under [`ConcurrencyStrategy::CancelOnNewState`].
    pub fn new<F>(effect: F) -> Self
    where
        F: Fn(S) -> ValueStream<E> + Send + Sync + 'static,
    {
        Self::with_strategy(effect, ConcurrencyStrategy::default())
    }

    /// Per-state effect under an explicit strategy.
    pub fn with_strategy<F>(effect: F, strategy: ConcurrencyStrategy) -> Self
    where
        F: Fn(S) -> ValueStream<E> + Send + Sync + 'static,
    {
        let effect = Arc::new(effect);
        Self::from_stream(move |states| {
            let effect = Arc::clone(&effect);
            let invoke = move |state: S| stream::catch_panics(effect(state));
            match strategy {
                ConcurrencyStrategy::CancelOnNewState => stream::switch_map(states, invoke),
                ConcurrencyStrategy::ContinueOnNewState => stream::merge_map(states, invoke),
            }
        })
    }

    /// Per-state effect whose streams may fail. The first failure of an
    /// invocation is logged and ends that invocation quietly.
    pub fn fallible<F, X>(effect: F, strategy: ConcurrencyStrategy) -> Self
    where
        F: Fn(S) -> ValueStream<Result<E, X>> + Send + Sync + 'static,
        X: Display + Send + 'static,
    {
        Self::fallible_with(effect, strategy, |_| None)
    }

    /// Like [`fallible`](Self::fallible), but `recover` may turn the failure
    /// into one last sentinel event.
    pub fn fallible_with<F, X, R>(effect: F, strategy: ConcurrencyStrategy, recover: R) -> Self
    where
        F: Fn(S) -> ValueStream<Result<E, X>> + Send + Sync + 'static,
        X: Display + Send + 'static,
        R: Fn(X) -> Option<E> + Send + Sync + 'static,
    {
        let recover = Arc::new(recover);
        Self::with_strategy(
            move |state| {
                let recover = Arc::clone(&recover);
                stream::absorb_failures(effect(state), move |failure| recover(failure))
            },
            strategy,
        )
    }

    /// Raw form: the effect sees the whole state stream at once.
    pub fn from_stream<F>(effect: F) -> Self
    where
        F: Fn(ValueStream<S>) -> ValueStream<E> + Send + Sync + 'static,
    {
        Self {
            branches: vec![Branch {
                effect: Arc::new(effect),
                context: None,
            }],
        }
    }

    /// State-independent effect, invoked once per loop run. Used to feed
    /// externally triggered events (user input, timers) into the loop.
    pub fn triggered<F>(effect: F) -> Self
    where
        F: Fn() -> ValueStream<E> + Send + Sync + 'static,
    {
        Self::from_stream(move |_states| effect())
    }

    /// Observe every state without emitting events.
    pub fn observer<F>(observe: F) -> Self
    where
        F: Fn(S) + Send + Sync + 'static,
    {
        let observe = Arc::new(observe);
        Self::from_stream(move |states| {
            let observe = Arc::clone(&observe);
            states
                .filter_map(move |state| {
                    observe(state);
                    future::ready(None::<E>)
                })
                .boxed()
        })
    }

    /// Listen to `gear`, turning each gear event into a loop event.
    /// `None` from `translate` means the event is ignored.
    ///
    /// Each run of the loop attaches its own listener. Events propagated
    /// before that are never seen; every later one is delivered once, as
    /// long as the listener stays within the gear's capacity. A listener
    /// that falls further behind loses the oldest events (logged at
    /// `warn`), see [`Gear::with_capacity`].
    pub fn attach<G, T>(gear: &Gear<G>, translate: T) -> Self
    where
        G: Clone + Send + 'static,
        T: Fn(G) -> Option<E> + Send + Sync + 'static,
    {
        let gear = gear.clone();
        let translate = Arc::new(translate);
        Self::triggered(move || {
            let translate = Arc::clone(&translate);
            gear.event_stream()
                .filter_map(move |event| future::ready(translate(event)))
                .boxed()
        })
    }

    /// Propagate a gear event for each state `to_gear` maps to `Some`.
    pub fn publish<G, P>(gear: &Gear<G>, to_gear: P) -> Self
    where
        G: Clone + Send + 'static,
        P: Fn(&S) -> Option<G> + Send + Sync + 'static,
    {
        let gear = gear.clone();
        Self::observer(move |state| {
            if let Some(event) = to_gear(&state) {
                gear.propagate(event);
            }
        })
    }

    /// Merge several feedbacks into one. Each keeps its own context and
    /// strategy.
    pub fn combine(feedbacks: impl IntoIterator<Item = Feedback<S, E>>) -> Self {
        Self {
            branches: feedbacks
                .into_iter()
                .flat_map(|feedback| feedback.branches)
                .collect(),
        }
    }

    /// Run this feedback's effects on `context`. Branches already pinned to
    /// a context keep theirs.
    pub fn execute_on(mut self, context: ExecutionContext) -> Self {
        for branch in &mut self.branches {
            if branch.context.is_none() {
                branch.context = Some(context.clone());
            }
        }
        self
    }

    /// Only states matching `predicate` reach the effect. A dropped state
    /// never supersedes an in-flight effect.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&S) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.adapt_input(move |states| {
            let predicate = Arc::clone(&predicate);
            states
                .filter(move |state| future::ready(predicate(state)))
                .boxed()
        })
    }

    /// Lift a feedback over a sub-state into one over `Outer`, using
    /// `extract` to derive what the effect sees.
    pub fn lens<Outer, L>(self, extract: L) -> Feedback<Outer, E>
    where
        Outer: Clone + Send + 'static,
        L: Fn(Outer) -> S + Send + Sync + 'static,
    {
        let extract = Arc::new(extract);
        self.adapt_input(move |states: ValueStream<Outer>| {
            let extract = Arc::clone(&extract);
            states.map(move |state| extract(state)).boxed()
        })
    }

    fn adapt_input<T, A>(self, adapt: A) -> Feedback<T, E>
    where
        T: Send + 'static,
        A: Fn(ValueStream<T>) -> ValueStream<S> + Send + Sync + 'static,
    {
        let adapt = Arc::new(adapt);
        Feedback {
            branches: self
                .branches
                .into_iter()
                .map(|branch| {
                    let adapt = Arc::clone(&adapt);
                    let effect = branch.effect;
                    Branch {
                        effect: Arc::new(move |states: ValueStream<T>| effect(adapt(states)))
                            as Effect<T, E>,
                        context: branch.context,
                    }
                })
                .collect(),
        }
    }

    /// Feed `states` through every branch and merge what they emit.
    pub fn run(&self, states: ValueStream<S>) -> ValueStream<E> {
        if let [branch] = self.branches.as_slice() {
            return branch.run(states);
        }

        let relay = StateRelay::new();
        let mut outputs = self.run_on(&relay);
        // Pumps the input into the relay; emits nothing itself.
        outputs.push(
            states
                .filter_map(move |state| {
                    relay.feed(state);
                    future::ready(None)
                })
                .boxed(),
        );
        futures_stream::select_all(outputs).boxed()
    }

    /// One event stream per branch, each reading its own copy of the relay.
    pub(crate) fn run_on(&self, relay: &StateRelay<S>) -> Vec<ValueStream<E>> {
        self.branches
            .iter()
            .map(|branch| branch.run(relay.subscribe()))
            .collect()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn observer_emits_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let feedback: Feedback<u32, ()> = Feedback::observer(move |s| sink.lock().unwrap().push(s));

        let events: Vec<()> = feedback
            .run(futures_stream::iter(vec![1, 2, 3]).boxed())
            .collect()
            .await;

        assert!(events.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn triggered_ignores_states() {
        let feedback: Feedback<u32, &str> = Feedback::triggered(|| stream::just("tick"));
        let events: Vec<&str> = feedback
            .run(futures_stream::iter(vec![1, 2, 3]).boxed())
            .collect()
            .await;
        assert_eq!(events, vec!["tick"]);
    }

    #[tokio::test]
    async fn panic_while_starting_drops_only_that_branch() {
        let combined = Feedback::combine([
            Feedback::triggered(|| -> ValueStream<u32> { panic!("setup failed") }),
            Feedback::new(|n: u32| stream::just(n + 1)),
        ]);

        let events: Vec<u32> = combined
            .run(futures_stream::iter(vec![1]).boxed())
            .collect()
            .await;
        assert_eq!(events, vec![2]);
    }

    #[tokio::test]
    async fn combine_keeps_every_branch() {
        let double = Feedback::new(|n: u32| stream::just(n * 2));
        let triple = Feedback::new(|n: u32| stream::just(n * 3));
        let combined = Feedback::combine([double, triple]);
        assert_eq!(combined.branch_count(), 2);

        let mut events: Vec<u32> = combined
            .run(futures_stream::iter(vec![5]).boxed())
            .collect()
            .await;
        events.sort_unstable();
        assert_eq!(events, vec![10, 15]);
    }

    #[tokio::test]
    async fn execute_on_keeps_pinned_branches() {
        let pinned = ExecutionContext::dedicated("pinned").unwrap();
        let other = ExecutionContext::dedicated("other").unwrap();

        let feedback = Feedback::combine([
            Feedback::new(|n: u32| stream::just(n)).execute_on(pinned.clone()),
            Feedback::new(|n: u32| stream::just(n)),
        ])
        .execute_on(other.clone());

        let contexts: Vec<_> = feedback
            .branches
            .iter()
            .map(|b| b.context.clone())
            .collect();
        assert_eq!(contexts, vec![Some(pinned), Some(other)]);
    }
}
