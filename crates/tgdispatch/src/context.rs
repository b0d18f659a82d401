//! Per-update execution context and its reuse pool.
//!
//! A [`Context`] is bound to exactly one update at a time. Workers take one
//! from the [`ContextPool`] as a [`PooledContext`] guard; the guard owns the
//! context exclusively and, when dropped, resets it and hands it back. The
//! reset runs on every exit path including unwinding, so no update or
//! cancellation scope can leak into the next event.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{ApiError, BotApi};
use crate::types::{Chat, Message, ParseMode, SendMessage, Update, User};

// =============================================================================
// Context
// =============================================================================

/// Everything a handler gets to see while processing one update.
pub struct Context {
    api: Arc<dyn BotApi>,
    update: Option<Update>,
    scope: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub(crate) fn new(api: Arc<dyn BotApi>, root: CancellationToken) -> Self {
        Self {
            api,
            update: None,
            scope: root,
            deadline: None,
        }
    }

    pub(crate) fn bind(&mut self, update: Update, scope: CancellationToken, deadline: Option<Instant>) {
        self.update = Some(update);
        self.scope = scope;
        self.deadline = deadline;
    }

    /// Clear the binding and detach any derived scope.
    pub(crate) fn reset(&mut self, root: &CancellationToken) {
        self.update = None;
        self.scope = root.clone();
        self.deadline = None;
    }

    /// The update being processed. `None` only outside of dispatch.
    pub fn update(&self) -> Option<&Update> {
        self.update.as_ref()
    }

    pub fn update_id(&self) -> Option<i64> {
        self.update.as_ref().map(|u| u.update_id)
    }

    pub fn message(&self) -> Option<&Message> {
        self.update.as_ref().and_then(Update::message_like)
    }

    /// Command name, without slash or `@botname`.
    pub fn command(&self) -> Option<&str> {
        self.message().and_then(Message::command)
    }

    /// Arguments following the command; empty if there are none.
    pub fn command_args(&self) -> &str {
        self.message().map(Message::command_args).unwrap_or_default()
    }

    pub fn sent_from(&self) -> Option<&User> {
        self.update.as_ref().and_then(Update::sent_from)
    }

    pub fn from_chat(&self) -> Option<&Chat> {
        self.update.as_ref().and_then(Update::from_chat)
    }

    pub fn api(&self) -> &Arc<dyn BotApi> {
        &self.api
    }

    /// Cancellation scope for this update.
    ///
    /// Fires on shutdown, and on the per-update deadline when a timeout is
    /// configured. Pass it to any work spawned on behalf of the update.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Resolves once the scope is cancelled or the deadline has passed.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.scope.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.scope.cancelled().await,
        }
    }

    pub async fn reply_text(&self, text: impl Into<String>) -> Result<Message, ApiError> {
        self.reply_with(text, |msg| msg).await
    }

    pub async fn reply_markdown(&self, text: impl Into<String>) -> Result<Message, ApiError> {
        self.reply_with(text, |msg| msg.parse_mode(ParseMode::Markdown))
            .await
    }

    pub async fn reply_html(&self, text: impl Into<String>) -> Result<Message, ApiError> {
        self.reply_with(text, |msg| msg.parse_mode(ParseMode::Html))
            .await
    }

    /// Reply to the originating chat, adjusting the message first.
    ///
    /// Web-page previews are disabled unless `configure` turns them back on.
    pub async fn reply_with<F>(&self, text: impl Into<String>, configure: F) -> Result<Message, ApiError>
    where
        F: FnOnce(SendMessage) -> SendMessage,
    {
        let chat = self.from_chat().ok_or(ApiError::NoChat)?;
        let mut message = SendMessage::new(chat.id, text);
        message.disable_web_page_preview = true;
        self.send(configure(message)).await
    }

    /// Send an arbitrary message, bounded by this context's scope.
    pub async fn send(&self, message: SendMessage) -> Result<Message, ApiError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ApiError::Cancelled),
            result = self.api.send_message(message) => result,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("update_id", &self.update_id())
            .field("cancelled", &self.scope.is_cancelled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Context Pool
// =============================================================================

/// Thread-safe pool of idle contexts.
///
/// Holds at most `max_idle` contexts; surplus contexts are dropped on
/// release instead of growing the pool.
pub(crate) struct ContextPool {
    api: Arc<dyn BotApi>,
    root: CancellationToken,
    idle: Mutex<Vec<Context>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl ContextPool {
    pub(crate) fn new(api: Arc<dyn BotApi>, root: CancellationToken, max_idle: usize) -> Self {
        Self {
            api,
            root,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// Take an idle context (or make one) and bind it to `update`.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        update: Update,
        scope: CancellationToken,
        deadline: Option<Instant>,
    ) -> PooledContext {
        let recycled = self.lock_idle().pop();
        let mut ctx = recycled.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Context::new(self.api.clone(), self.root.clone())
        });
        ctx.bind(update, scope, deadline);
        PooledContext {
            ctx: Some(ctx),
            pool: self.clone(),
        }
    }

    fn release(&self, mut ctx: Context) {
        ctx.reset(&self.root);
        let mut idle = self.lock_idle();
        if idle.len() < self.max_idle {
            idle.push(ctx);
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Context>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("context pool mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Contexts constructed so far (recycled ones are not counted twice).
    #[cfg(test)]
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Exclusive handle to a pooled context. Returns it to the pool on drop.
pub(crate) struct PooledContext {
    ctx: Option<Context>,
    pool: Arc<ContextPool>,
}

impl Deref for PooledContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        // Only `Drop` takes the context out.
        self.ctx.as_ref().unwrap_or_else(|| unreachable!("context released"))
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_mut().unwrap_or_else(|| unreachable!("context released"))
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
