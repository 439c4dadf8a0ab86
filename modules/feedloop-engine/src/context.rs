//! Execution contexts: where a feedback or reducer does its work.
//!
//! A context is a cheap, cloneable handle onto a tokio runtime. Two handles
//! compare equal only if they were cloned from the same context.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{LoopError, Result};
use crate::stream::ValueStream;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Caller-supplied factory for the context a loop runs on when none was
/// given explicitly.
pub type ContextFactory = Arc<dyn Fn() -> Result<ExecutionContext> + Send + Sync>;

/// Opaque handle on a scheduling target.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    name: String,
    handle: Handle,
    /// Dropping this stops the dedicated worker thread, if there is one.
    shutdown: Option<oneshot::Sender<()>>,
}

impl ExecutionContext {
    /// Wrap the runtime the caller is currently running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| LoopError::NoRuntime)?;
        Ok(Self::from_handle("current", handle))
    }

    /// Wrap an existing runtime handle.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::assemble(name.into(), handle, None)
    }

    /// Start a context backed by its own OS thread running a
    /// single-threaded runtime. Work scheduled on it runs serially.
    ///
    /// The thread shuts down once every clone of the context is dropped.
    pub fn dedicated(name: impl Into<String>) -> Result<Self> {
        Self::dedicated_with(&EngineConfig::default(), name)
    }

    pub fn dedicated_with(config: &EngineConfig, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let thread_name = format!("{}-{}", config.context_thread_prefix, name);
        let label = name.clone();
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                // Resolves with an error once the sender is dropped.
                let _ = runtime.block_on(stopped);
                debug!(context = label.as_str(), "Dedicated context stopped");
            })?;

        Ok(Self::assemble(name, handle, Some(shutdown)))
    }

    fn assemble(name: String, handle: Handle, shutdown: Option<oneshot::Sender<()>>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name,
                handle,
                shutdown,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Schedule a future on this context.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Run a closure on this context.
    pub fn run<F>(&self, work: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { work() })
    }

    /// Wait for `duration` as measured by this context's timer.
    pub async fn sleep(&self, duration: Duration) {
        let _ = self
            .spawn(async move { tokio::time::sleep(duration).await })
            .await;
    }

    /// Poll `source` from a task on this context and deliver its values,
    /// in order, to whoever polls the returned stream.
    ///
    /// The returned stream holds this context, so a dedicated context stays
    /// up while it is read. Dropping it aborts the task and with it `source`.
    pub fn observe_on<V: Send + 'static>(&self, source: ValueStream<V>) -> ValueStream<V> {
        let (tx, rx) = mpsc::unbounded();
        let task = self.spawn(async move {
            let mut source = source;
            while let Some(value) = source.next().await {
                if tx.unbounded_send(value).is_err() {
                    break;
                }
            }
        });

        Forwarded {
            rx,
            _task: AbortOnDrop(task.abort_handle()),
            _context: self.clone(),
        }
        .boxed()
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ExecutionContext {}

impl std::hash::Hash for ExecutionContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("dedicated", &self.inner.shutdown.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Forwarding stream
// ---------------------------------------------------------------------------

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Forwarded<V> {
    rx: mpsc::UnboundedReceiver<V>,
    _task: AbortOnDrop,
    // Keeps a dedicated worker thread up for as long as the stream is read.
    _context: ExecutionContext,
}

impl<V> Stream for Forwarded<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<V>> {
        self.rx.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn clones_share_identity() {
        let a = ExecutionContext::current().unwrap();
        let b = ExecutionContext::current().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn current_requires_runtime() {
        assert!(matches!(
            ExecutionContext::current(),
            Err(LoopError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn dedicated_context_runs_on_named_thread() {
        let config = EngineConfig::builder().context_thread_prefix("test").build();
        let context = ExecutionContext::dedicated_with(&config, "worker").unwrap();

        let name = context
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
    }

    #[tokio::test]
    async fn run_executes_closure_on_context() {
        let context = ExecutionContext::dedicated("runner").unwrap();
        let (tx, rx) = oneshot::channel();
        context.run(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_owned));
        });
        assert_eq!(rx.await.unwrap().as_deref(), Some("feedloop-runner"));
    }

    #[tokio::test]
    async fn observe_on_preserves_order() {
        let context = ExecutionContext::dedicated("observer").unwrap();
        let values: Vec<u32> = context
            .observe_on(stream::iter(0..100).boxed())
            .collect()
            .await;
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn observed_stream_outlives_context_handle() {
        let slow = stream::iter(0..3u32)
            .then(|n| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                n
            })
            .boxed();
        let observed = ExecutionContext::dedicated("short-lived")
            .unwrap()
            .observe_on(slow);

        let values: Vec<u32> = observed.collect().await;
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_on_context_timer() {
        let context = ExecutionContext::current().unwrap();
        let started = tokio::time::Instant::now();
        context.sleep(Duration::from_millis(300)).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
