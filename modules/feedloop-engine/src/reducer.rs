//! The reducer: the single pure fold of a loop.

use std::fmt;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};
use tracing::trace;

use crate::context::ExecutionContext;
use crate::stream::ValueStream;

/// Pure `(State, Event) → State` fold, scheduled on an execution context.
///
/// No I/O, no side effects. Folds never overlap: each event is folded to
/// completion before the next one is taken.
pub struct Reducer<S, E> {
    fold: Arc<dyn Fn(S, E) -> S + Send + Sync>,
    context: ExecutionContext,
}

impl<S, E> Clone for Reducer<S, E> {
    fn clone(&self) -> Self {
        Self {
            fold: Arc::clone(&self.fold),
            context: self.context.clone(),
        }
    }
}

impl<S, E> fmt::Debug for Reducer<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<S, E> Reducer<S, E>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(fold: F, context: ExecutionContext) -> Self
    where
        F: Fn(S, E) -> S + Send + Sync + 'static,
    {
        Self {
            fold: Arc::new(fold),
            context,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Fold a single event.
    pub fn reduce(&self, state: S, event: E) -> S {
        (self.fold)(state, event)
    }

    /// Turn an event stream into the state stream it produces: the seed
    /// first, then one state per folded event, in order.
    ///
    /// `events` is polled and folded from a task on the reducer's context.
    pub fn apply(&self, initial: S, events: ValueStream<E>) -> ValueStream<S> {
        let fold = Arc::clone(&self.fold);
        let folded = events.scan(Some(initial.clone()), move |slot, event| {
            let next = slot.take().map(|state| fold(state, event));
            trace!("Folded event");
            slot.clone_from(&next);
            future::ready(next)
        });

        self.context
            .observe_on(stream::once(future::ready(initial)).chain(folded).boxed())
    }
}
