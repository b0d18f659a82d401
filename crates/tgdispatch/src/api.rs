//! The outbound seam to the bot service.
//!
//! The dispatcher never speaks HTTP itself. Everything it needs from the
//! remote side goes through [`BotApi`]: one long-poll fetch per cycle, the
//! command-menu registration at startup, and `sendMessage` for replies.
//! Substituting the transport means handing a different `Arc<dyn BotApi>`
//! to the builder.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::{BotCommand, Message, SendMessage, Update};

/// Parameters for one `getUpdates` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetUpdates {
    /// Smallest update id not yet acknowledged.
    pub offset: i64,
    pub limit: u32,
    /// Long-poll timeout in seconds.
    pub timeout: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_updates: Vec<String>,
}

/// Errors surfaced by a [`BotApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The call observed cancellation. Never reported as a transport failure.
    #[error("request cancelled")]
    Cancelled,

    /// The service answered with `ok: false`.
    #[error("bot api error {code}: {description}")]
    Telegram { code: i64, description: String },

    /// A reply was requested for an update that has no chat.
    #[error("update has no chat to reply to")]
    NoChat,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ApiError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

/// Client for the remote bot service.
///
/// Implementations must be cheap to share: the dispatcher holds one
/// `Arc<dyn BotApi>` and calls it from the polling loop and from every
/// worker concurrently.
#[async_trait]
pub trait BotApi: Send + Sync + 'static {
    /// Fetch the next batch of updates. Blocks for up to `request.timeout`
    /// seconds when nothing is pending.
    async fn get_updates(&self, request: &GetUpdates) -> Result<Vec<Update>, ApiError>;

    /// Replace the command menu shown by clients.
    async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), ApiError>;

    async fn send_message(&self, message: SendMessage) -> Result<Message, ApiError>;
}
