//! Worker pool and the per-update execution lifecycle.
//!
//! Every worker loops on the shared receiving half of the distribution
//! channel. For each update it:
//!
//! 1. takes a context from the pool and binds it to the update
//! 2. derives a deadline-bounded scope if a timeout is configured
//! 3. routes the update under panic recovery
//! 4. reports whatever went wrong through the error handler
//! 5. releases the context (reset happens in the guard's `Drop`)
//!
//! With a task pool configured, steps 1-5 are submitted as one task and the
//! worker moves on; a rejected task is run inline by the worker instead.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::context::{Context, ContextPool};
use crate::error::{DispatchError, ErrorHandler};
use crate::handler::PanicHandler;
use crate::router::{Route, Router};
use crate::task_pool::{Rejected, TaskPool};
use crate::types::Update;

/// Receiving half of the distribution channel, shared by all workers.
pub(crate) type UpdateReceiver = Arc<Mutex<mpsc::Receiver<Update>>>;

// =============================================================================
// Dispatcher
// =============================================================================

/// State shared by every worker. Read-only once the bot is built.
pub(crate) struct Dispatcher {
    pub(crate) router: Router,
    pub(crate) contexts: Arc<ContextPool>,
    pub(crate) task_pool: Option<Arc<dyn TaskPool>>,
    /// Executions placed on the task pool, awaited on shutdown.
    pub(crate) executions: TaskTracker,
    pub(crate) on_error: ErrorHandler,
    pub(crate) on_panic: PanicHandler,
    pub(crate) timeout: Option<Duration>,
    pub(crate) root: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn report(&self, err: DispatchError) {
        (self.on_error)(err);
    }

    /// Run one update, inline or on the task pool.
    pub(crate) async fn dispatch(self: &Arc<Self>, update: Update) {
        let Some(pool) = &self.task_pool else {
            self.execute(update).await;
            return;
        };

        let update_id = update.update_id;
        let this = self.clone();
        let task = self
            .executions
            .track_future(async move { this.execute(update).await })
            .boxed();

        if let Err(Rejected { task, reason }) = pool.submit(task) {
            warn!(update_id, %reason, "task pool rejected update, executing inline");
            self.report(DispatchError::Submit {
                update_id,
                source: reason,
            });
            task.await;
        }
    }

    /// The full lifecycle for one update. Never panics, never returns an error.
    pub(crate) async fn execute(&self, update: Update) {
        let update_id = update.update_id;
        // A timeout too large to represent as an instant means no deadline.
        let (scope, deadline) = match self.timeout {
            Some(timeout) => (self.root.child_token(), Instant::now().checked_add(timeout)),
            None => (self.root.clone(), None),
        };
        // Cancels the derived scope once this execution is over.
        let _scope_guard = self.timeout.map(|_| scope.clone().drop_guard());
        let ctx = self.contexts.acquire(update, scope, deadline);

        match AssertUnwindSafe(self.route(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(err),
            Err(payload) => self.recover(&ctx, update_id, payload).await,
        }
    }

    async fn route(&self, ctx: &Context) -> Result<(), DispatchError> {
        let Some(update) = ctx.update() else {
            return Ok(());
        };
        let update_id = update.update_id;

        let (handler, command) = match self.router.route(update) {
            Route::Command { name, handler } => {
                debug!(update_id, command = name, "routing command");
                (handler, Some(name))
            }
            Route::Update(handler) => {
                debug!(update_id, kind = %update.kind(), "routing update");
                (handler, None)
            }
            Route::Ignore => {
                trace!(update_id, kind = %update.kind(), "no handler for update");
                return Ok(());
            }
        };

        let handled = handler.handle(ctx);
        let result = match (ctx.deadline(), self.timeout) {
            (Some(deadline), Some(timeout)) => {
                match tokio::time::timeout_at(deadline, handled).await {
                    Ok(result) => result,
                    Err(_) => {
                        ctx.cancellation().cancel();
                        return Err(DispatchError::Timeout { update_id, timeout });
                    }
                }
            }
            _ => handled.await,
        };

        result.map_err(|source| DispatchError::Handler {
            update_id,
            command: command.map(str::to_owned),
            source,
        })
    }

    /// Turn a caught panic into a report and an optional apology.
    async fn recover(&self, ctx: &Context, update_id: i64, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        error!(update_id, panic = %message, "handler panicked");

        let reply = (self.on_panic)(&message);
        self.report(DispatchError::Panic { update_id, message });
        if reply.is_empty() {
            return;
        }
        if let Err(source) = ctx.reply_text(reply).await {
            self.report(DispatchError::Reply { update_id, source });
        }
    }
}

/// Extract a human-readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commands", &self.router.registry().len())
            .field("timeout", &self.timeout)
            .field("task_pool", &self.task_pool.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Counts a worker as active for as long as it lives.
pub(crate) struct ActiveWorker(Arc<AtomicUsize>);

impl ActiveWorker {
    pub(crate) fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active.clone())
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One consumer. Exits on cancellation or when the channel closes.
pub(crate) async fn run_worker(
    dispatcher: Arc<Dispatcher>,
    worker: usize,
    updates: UpdateReceiver,
    _active: ActiveWorker,
) {
    debug!(worker, "worker started");
    loop {
        let update = tokio::select! {
            biased;
            _ = dispatcher.root.cancelled() => break,
            update = next_update(&updates) => match update {
                Some(update) => update,
                None => break,
            },
        };
        dispatcher.dispatch(update).await;
    }
    debug!(worker, "worker stopped");
}

async fn next_update(updates: &UpdateReceiver) -> Option<Update> {
    updates.lock().await.recv().await
}
