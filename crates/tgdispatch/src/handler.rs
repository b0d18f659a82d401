//! Handler traits and command definitions.
//!
//! A handler borrows the [`Context`] for the duration of one call. It cannot
//! keep the context afterwards, which is what lets the dispatcher recycle
//! contexts between updates.
//!
//! # Example
//!
//! ```ignore
//! use futures::FutureExt;
//! use tgdispatch_core::{handler_fn, Command};
//!
//! let ping = Command::new(
//!     "ping",
//!     "check the bot is alive",
//!     handler_fn(|ctx| {
//!         async move {
//!             ctx.reply_text("pong").await?;
//!             anyhow::Ok(())
//!         }
//!         .boxed()
//!     }),
//! );
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::types::BotCommand;

/// Default reply for a recovered panic.
pub const DEFAULT_PANIC_REPLY: &str = "oops! Service is temporarily unavailable";

/// Handles one update.
///
/// Used for command handlers, the unrecognized-command fallback and the
/// catch-all update handler. Returned errors are reported through the
/// error handler; they never stop the worker.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &Context) -> Result<()>;
}

/// Handler backed by a closure. Build one with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Adapt a closure returning a boxed future into a [`Handler`].
///
/// The closure receives the borrowed context; the future may borrow it too.
/// Use `FutureExt::boxed` to produce the `BoxFuture`.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &Context) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Turns a panic message into the reply sent back to the chat.
///
/// An empty string suppresses the reply.
pub type PanicHandler = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub(crate) fn default_panic_handler() -> PanicHandler {
    Arc::new(|_message: &str| DEFAULT_PANIC_REPLY.to_string())
}

/// A named command and its handler.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub description: String,
    /// Hidden commands are routable but left out of the client menu.
    pub hidden: bool,
    handler: Arc<dyn Handler>,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Handler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            hidden: false,
            handler: Arc::new(handler),
        }
    }

    /// Keep the command out of the menu.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn to_bot_command(&self) -> BotCommand {
        BotCommand {
            command: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{} - {}", self.name, self.description)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("hidden", &self.hidden)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop() -> impl Handler {
        handler_fn(|_ctx| async { Ok(()) }.boxed())
    }

    #[test]
    fn test_command_display() {
        let cmd = Command::new("start", "begin a conversation", noop());
        assert_eq!(cmd.to_string(), "/start - begin a conversation");
        assert!(!cmd.hidden);
    }

    #[test]
    fn test_hidden_command() {
        let cmd = Command::new("debug", "internal", noop()).hidden();
        assert!(cmd.hidden);
        assert_eq!(
            cmd.to_bot_command(),
            BotCommand {
                command: "debug".into(),
                description: "internal".into(),
            }
        );
    }

    #[test]
    fn test_default_panic_reply() {
        let handler = default_panic_handler();
        assert_eq!(handler("boom"), DEFAULT_PANIC_REPLY);
    }
}
