//! The push-stream contract every part of the loop speaks.
//!
//! A [`ValueStream`] is a boxed `futures::Stream` with no error channel.
//! Producers that fail internally end their stream (see [`absorb_failures`])
//! instead of surfacing the failure to the loop.

use std::any::Any;
use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::task::AbortHandle;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::context::ExecutionContext;

/// A non-failing push stream of `V`.
pub type ValueStream<V> = BoxStream<'static, V>;

/// A stream that completes immediately with no values.
pub fn empty<V: Send + 'static>() -> ValueStream<V> {
    stream::empty().boxed()
}

/// A stream that yields `value` once and completes.
pub fn just<V: Send + 'static>(value: V) -> ValueStream<V> {
    stream::once(future::ready(value)).boxed()
}

/// A stream that yields `value` once after `after` has elapsed.
///
/// The timer is armed when the stream is first polled, on whatever runtime
/// polls it.
pub fn delayed<V: Send + 'static>(value: V, after: Duration) -> ValueStream<V> {
    stream::once(async move {
        tokio::time::sleep(after).await;
        value
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to an active stream subscription.
///
/// Cancelling (or dropping) the handle aborts the task that drives the
/// stream, which drops the stream and everything upstream of it.
pub struct Subscription {
    id: Uuid,
    handle: AbortHandle,
}

impl Subscription {
    pub(crate) fn new(id: Uuid, handle: AbortHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop delivery. Idempotent.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// True once the driving task has completed, been cancelled, or panicked.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Drive `source` from a task on `context`, handing each value to
/// `on_value` and calling `on_complete` once the stream ends.
///
/// `on_complete` is not called when the subscription is cancelled.
pub fn subscribe<V, F, C>(
    source: ValueStream<V>,
    context: &ExecutionContext,
    mut on_value: F,
    on_complete: C,
) -> Subscription
where
    V: Send + 'static,
    F: FnMut(V) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let id = Uuid::new_v4();
    let task = context.spawn(
        async move {
            let mut source = source;
            while let Some(value) = source.next().await {
                on_value(value);
            }
            on_complete();
        }
        .in_current_span(),
    );
    Subscription::new(id, task.abort_handle())
}

// ---------------------------------------------------------------------------
// Concurrency operators
// ---------------------------------------------------------------------------

/// Map every input to an inner stream, keeping only the latest one alive.
///
/// When a new input arrives while the previous inner stream is still
/// running, the previous one is dropped and its remaining values are lost.
pub fn switch_map<S, E, F>(input: ValueStream<S>, project: F) -> ValueStream<E>
where
    S: Send + 'static,
    E: Send + 'static,
    F: FnMut(S) -> ValueStream<E> + Send + 'static,
{
    SwitchMap {
        outer: Some(input),
        inner: None,
        project,
    }
    .boxed()
}

/// Map every input to an inner stream and run them all side by side.
pub fn merge_map<S, E, F>(input: ValueStream<S>, project: F) -> ValueStream<E>
where
    S: Send + 'static,
    E: Send + 'static,
    F: FnMut(S) -> ValueStream<E> + Send + 'static,
{
    input.flat_map_unordered(None::<usize>, project).boxed()
}

struct SwitchMap<S, E, F> {
    outer: Option<ValueStream<S>>,
    inner: Option<ValueStream<E>>,
    project: F,
}

// No field is ever pinned structurally; the streams are boxed.
impl<S, E, F> Unpin for SwitchMap<S, E, F> {}

impl<S, E, F> Stream for SwitchMap<S, E, F>
where
    F: FnMut(S) -> ValueStream<E>,
{
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        let this = &mut *self;

        // Drain the outer stream first so the newest input always wins.
        while let Some(outer) = this.outer.as_mut() {
            match outer.poll_next_unpin(cx) {
                Poll::Ready(Some(value)) => {
                    if this.inner.is_some() {
                        debug!("Superseding in-flight effect");
                    }
                    this.inner = Some((this.project)(value));
                }
                Poll::Ready(None) => this.outer = None,
                Poll::Pending => break,
            }
        }

        if let Some(inner) = this.inner.as_mut() {
            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => this.inner = None,
                Poll::Pending => {}
            }
        }

        if this.outer.is_none() && this.inner.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

// ---------------------------------------------------------------------------
// Failure absorption
// ---------------------------------------------------------------------------

/// Turn a fallible stream into a non-failing one.
///
/// Values pass through until the first `Err`. That error is logged, handed
/// to `recover` (which may supply one last sentinel value), and the stream
/// completes. The source is dropped at that point.
pub fn absorb_failures<V, X, R>(source: ValueStream<Result<V, X>>, recover: R) -> ValueStream<V>
where
    V: Send + 'static,
    X: Display + Send + 'static,
    R: FnMut(X) -> Option<V> + Send + 'static,
{
    stream::unfold(Some((source, recover)), |state| async move {
        let (mut source, mut recover) = state?;
        match source.next().await? {
            Ok(value) => Some((Some(value), Some((source, recover)))),
            Err(failure) => {
                warn!(error = %failure, "Effect failed; completing its branch");
                Some((recover(failure), None))
            }
        }
    })
    .filter_map(future::ready)
    .boxed()
}

/// End the stream quietly if polling it panics.
pub fn catch_panics<V: Send + 'static>(source: ValueStream<V>) -> ValueStream<V> {
    AssertUnwindSafe(source)
        .catch_unwind()
        .scan((), |_, item| {
            future::ready(match item {
                Ok(value) => Some(value),
                Err(payload) => {
                    warn!(panic = panic_message(&*payload), "Effect panicked; completing its branch");
                    None
                }
            })
        })
        .boxed()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
