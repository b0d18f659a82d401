//! # tgdispatch
//!
//! A long-polling update dispatcher for chat bots: one loop fetches updates,
//! a bounded channel distributes them, and a fixed pool of workers routes
//! each one to a command handler under a per-update timeout and panic
//! recovery.
//!
//! ## Architecture
//!
//! ```text
//! BotApi::get_updates(offset)
//!     │
//!     ▼
//! Poller (owns the watermark) ── drops update_id < offset
//!     │
//!     ▼ send (blocks when full)
//! bounded mpsc channel
//!     │
//!     ├─► worker 0 ─┐
//!     ├─► worker 1 ─┼─► inline, or TaskPool::submit ──┐
//!     └─► worker N ─┘                                 │
//!                                                     ▼
//!                          ContextPool::acquire ─► Router::route
//!                                                     │
//!                          ┌──────────────────────────┼───────────────┐
//!                          ▼                          ▼               ▼
//!                   command handler       unrecognized fallback   updates handler
//!                          │
//!                          └─► Context::reply_* ─► BotApi::send_message
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Watermark is monotonic** - it advances past an update only after the
//!    update is in the channel
//! 2. **No re-delivery** - updates below the watermark are dropped
//! 3. **Backpressure** - a full channel stalls fetching, never drops
//! 4. **Exactly once** - an update runs on the task pool or inline, not both
//! 5. **Workers survive** - handler errors, timeouts and panics are reported
//!    and the worker moves on
//! 6. **Clean contexts** - a pooled context never carries state between updates
//!
//! ## Example
//!
//! ```ignore
//! use futures::FutureExt;
//! use tgdispatch_core::{handler_fn, Bot, Command};
//!
//! let bot = Bot::builder(client)
//!     .with_workers(4)
//!     .with_timeout(Duration::from_secs(10))
//!     .with_command(Command::new(
//!         "ping",
//!         "check the bot is alive",
//!         handler_fn(|ctx| async move {
//!             ctx.reply_text("pong").await?;
//!             anyhow::Ok(())
//!         }.boxed()),
//!     ))
//!     .build()?;
//!
//! bot.run().await?;
//! ```

mod api;
mod bot;
mod config;
mod context;
mod error;
mod handler;
mod poller;
mod router;
mod task_pool;
mod types;
mod worker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use api::{ApiError, BotApi, GetUpdates};
pub use bot::{Bot, BotBuilder, BotHandle, LifecycleState};
pub use config::{
    default_workers, BotConfig, DEFAULT_POLL_TIMEOUT_SECS, DEFAULT_RETRY_DELAY,
    MAX_POLL_TIMEOUT_SECS, MAX_UPDATE_LIMIT,
};
pub use context::Context;
pub use error::{ConfigError, DispatchError, ErrorHandler};
pub use handler::{handler_fn, Command, FnHandler, Handler, PanicHandler, DEFAULT_PANIC_REPLY};
pub use router::{CommandRegistry, UnrecognizedCommand, UNRECOGNIZED_COMMAND_REPLY};
pub use task_pool::{BoundedTaskPool, Rejected, SubmitError, Task, TaskPool};
pub use types::{
    BotCommand, CallbackQuery, Chat, Message, MessageEntity, ParseMode, SendMessage, Update,
    UpdateKind, User,
};
