//! Ordered handler chain run once per completed message.
//!
//! Each handler receives the connection's [`Context`] and a [`Next`]
//! continuation.  Calling `next.run().await` invokes the following handler;
//! not calling it stops the chain, which is a legitimate outcome and not an
//! error.  After the last handler, `next.run()` is a no-op that marks the
//! dispatch as completed.
//!
//! ```text
//!  dispatch ──► h0(ctx, next@1) ──► h1(ctx, next@2) ──► … ──► terminal
//!                    ▲                   │
//!                    └── Err / panic ────┘  caught once, at dispatch
//! ```
//!
//! Errors propagate outward through the `?` in each handler, so the dispatch
//! boundary is the single place where a fault is turned into an
//! [`AsyncFault`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::trace;

use crate::application::context::Context;
use crate::domain::AsyncFault;

/// A step of the message pipeline.
///
/// Implemented automatically for closures of the shape
/// `Fn(Arc<Context>, Next) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Arc<Context>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
        (self)(ctx, next).await
    }
}

/// How one dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler advanced and the terminal step was reached.
    Completed,
    /// The handler at index `at` returned without advancing.
    Halted { at: usize },
    /// A handler returned an error or panicked.
    Faulted(AsyncFault),
}

const NO_INDEX: usize = usize::MAX;

/// Shared bookkeeping of one dispatch.
#[derive(Debug)]
struct Progress {
    /// Deepest handler index entered so far.
    deepest: AtomicUsize,
    /// Innermost handler that returned `Err`.
    fault: AtomicUsize,
    completed: AtomicBool,
}

impl Progress {
    fn new() -> Self {
        Self {
            deepest: AtomicUsize::new(NO_INDEX),
            fault: AtomicUsize::new(NO_INDEX),
            completed: AtomicBool::new(false),
        }
    }

    fn enter(&self, index: usize) {
        let _ = self
            .deepest
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == NO_INDEX || index > current).then_some(index)
            });
    }

    fn fail(&self, index: usize) {
        // First writer wins: the innermost handler fails before its callers.
        let _ = self
            .fault
            .compare_exchange(NO_INDEX, index, Ordering::AcqRel, Ordering::Acquire);
    }

    fn deepest(&self) -> Option<usize> {
        index(self.deepest.load(Ordering::Acquire))
    }

    fn fault(&self) -> Option<usize> {
        index(self.fault.load(Ordering::Acquire))
    }
}

fn index(raw: usize) -> Option<usize> {
    (raw != NO_INDEX).then_some(raw)
}

/// Continuation bound to a position in the handler chain.
pub struct Next {
    chain: Arc<[Arc<dyn Handler>]>,
    index: usize,
    ctx: Arc<Context>,
    progress: Arc<Progress>,
}

impl Next {
    /// Runs the rest of the chain, starting at this continuation's position.
    ///
    /// # Errors
    ///
    /// Whatever a later handler returns.  Handlers normally forward it with
    /// `?` so the dispatch can report it.
    pub async fn run(self) -> anyhow::Result<()> {
        let Some(handler) = self.chain.get(self.index).cloned() else {
            self.progress.completed.store(true, Ordering::Release);
            return Ok(());
        };

        let index = self.index;
        self.progress.enter(index);
        trace!("connection {}: handler #{index}", self.ctx.id());

        let next = Next {
            chain: self.chain,
            index: index + 1,
            ctx: Arc::clone(&self.ctx),
            progress: Arc::clone(&self.progress),
        };
        let result = handler.handle(self.ctx, next).await;
        if result.is_err() {
            self.progress.fail(index);
        }
        result
    }

    /// Position of the handler this continuation will invoke.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.chain.len())
            .finish()
    }
}

/// Registered handlers, in registration order.
#[derive(Default)]
pub struct Pipeline {
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler.  Dispatches already running keep the list they
    /// started with.
    pub fn use_handler(&self, handler: impl Handler) -> &Self {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<[Arc<dyn Handler>]> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Runs the chain once over `ctx`.
    ///
    /// Errors and panics from any depth are caught here, exactly once, and
    /// returned as [`DispatchOutcome::Faulted`].  Reporting the fault is the
    /// caller's job.
    pub async fn dispatch(&self, ctx: Arc<Context>) -> DispatchOutcome {
        let id = ctx.id();
        let progress = Arc::new(Progress::new());
        let start = Next {
            chain: self.snapshot(),
            index: 0,
            ctx,
            progress: Arc::clone(&progress),
        };

        match AssertUnwindSafe(start.run()).catch_unwind().await {
            Ok(Ok(())) if progress.completed.load(Ordering::Acquire) => DispatchOutcome::Completed,
            Ok(Ok(())) => DispatchOutcome::Halted {
                at: progress.deepest().unwrap_or(0),
            },
            Ok(Err(error)) => {
                DispatchOutcome::Faulted(AsyncFault::from_error(id, progress.fault(), &error))
            }
            Err(panic) => {
                DispatchOutcome::Faulted(AsyncFault::from_panic(id, progress.deepest(), panic.as_ref()))
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("len", &self.len()).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::EventSink;
    use crate::domain::{ConnectionId, RequestMeta};
    use anyhow::Context as _;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn context() -> Arc<Context> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Context::new(
            ConnectionId::new(),
            RequestMeta::default(),
            tx,
            EventSink::new(8),
        ))
    }

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let pipeline = Pipeline::new();
        assert_eq!(pipeline.dispatch(context()).await, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        // Arrange
        let log = recorder();
        let pipeline = Pipeline::new();
        for name in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(name);
                    next.run().await
                }
            });
        }

        // Act
        let outcome = pipeline.dispatch(context()).await;

        // Assert
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_code_after_next_runs_after_inner_handlers() {
        let log = recorder();
        let pipeline = Pipeline::new();
        {
            let log = Arc::clone(&log);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("outer-before");
                    next.run().await?;
                    log.lock().unwrap().push("outer-after");
                    Ok(())
                }
            });
        }
        {
            let log = Arc::clone(&log);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("inner");
                    next.run().await
                }
            });
        }

        pipeline.dispatch(context()).await;

        assert_eq!(*log.lock().unwrap(), vec!["outer-before", "inner", "outer-after"]);
    }

    #[tokio::test]
    async fn test_handler_that_does_not_advance_halts_chain() {
        // Arrange: h0 advances, h1 stops, h2 must never run.
        let log = recorder();
        let pipeline = Pipeline::new();
        pipeline.use_handler(|_ctx: Arc<Context>, next: Next| next.run());
        {
            let log = Arc::clone(&log);
            pipeline.use_handler(move |_ctx: Arc<Context>, _next: Next| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("h1");
                    Ok::<(), anyhow::Error>(())
                }
            });
        }
        {
            let log = Arc::clone(&log);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("h2");
                    next.run().await
                }
            });
        }

        // Act
        let outcome = pipeline.dispatch(context()).await;

        // Assert
        assert_eq!(outcome, DispatchOutcome::Halted { at: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_error_is_caught_once_with_origin_index() {
        // Arrange: the error comes from the innermost handler and passes
        // through h0's `?` on its way out.
        let pipeline = Pipeline::new();
        pipeline.use_handler(|_ctx: Arc<Context>, next: Next| async move {
            next.run().await?;
            Ok(())
        });
        pipeline.use_handler(|_ctx: Arc<Context>, _next: Next| async move {
            Err::<(), _>(anyhow::anyhow!("connection refused")).context("database unavailable")
        });
        let ctx = context();
        let id = ctx.id();

        // Act
        let outcome = pipeline.dispatch(ctx).await;

        // Assert
        match outcome {
            DispatchOutcome::Faulted(fault) => {
                assert_eq!(fault.connection, id);
                assert_eq!(fault.handler_index, Some(1));
                assert_eq!(fault.message, "database unavailable");
                assert_eq!(fault.causes, vec!["connection refused".to_string()]);
                assert!(fault.to_string().starts_with("<kocket> AsyncError: database unavailable"));
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_caught_as_fault() {
        let pipeline = Pipeline::new();
        pipeline.use_handler(|_ctx: Arc<Context>, next: Next| next.run());
        pipeline.use_handler(|_ctx: Arc<Context>, _next: Next| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        });

        match pipeline.dispatch(context()).await {
            DispatchOutcome::Faulted(fault) => {
                assert_eq!(fault.handler_index, Some(1));
                assert_eq!(fault.message, "panic: boom");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fault_does_not_poison_next_dispatch() {
        // Arrange: fails on the first message only.
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new();
        {
            let calls = Arc::clone(&calls);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("first message rejected");
                    }
                    next.run().await
                }
            });
        }
        let ctx = context();

        // Act
        let first = pipeline.dispatch(Arc::clone(&ctx)).await;
        let second = pipeline.dispatch(ctx).await;

        // Assert
        assert!(matches!(first, DispatchOutcome::Faulted(_)));
        assert_eq!(second, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_handlers_added_later_do_not_affect_running_snapshot() {
        let pipeline = Arc::new(Pipeline::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        {
            let release_rx = Arc::clone(&release_rx);
            pipeline.use_handler(move |_ctx: Arc<Context>, next: Next| {
                let release_rx = Arc::clone(&release_rx);
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    next.run().await
                }
            });
        }

        let running = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.dispatch(context()).await })
        };
        tokio::task::yield_now().await;
        pipeline.use_handler(|_ctx: Arc<Context>, _next: Next| async move {
            Ok::<(), anyhow::Error>(())
        });
        let _ = release_tx.send(());

        assert_eq!(running.await.unwrap(), DispatchOutcome::Completed);
        assert_eq!(pipeline.len(), 2);
    }

    struct Tagger;

    #[async_trait]
    impl Handler for Tagger {
        async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
            ctx.set_name("tagged");
            next.run().await
        }
    }

    #[tokio::test]
    async fn test_trait_handler_and_closure_mix() {
        let pipeline = Pipeline::new();
        pipeline.use_handler(Tagger).use_handler(|ctx: Arc<Context>, next: Next| async move {
            anyhow::ensure!(ctx.name().as_deref() == Some("tagged"), "name not set");
            next.run().await
        });

        assert_eq!(pipeline.dispatch(context()).await, DispatchOutcome::Completed);
    }
}
