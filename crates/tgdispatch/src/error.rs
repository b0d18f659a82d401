//! Error taxonomy and the single reporting funnel.
//!
//! Nothing below the worker boundary ever terminates the process. Every
//! failure is turned into a [`DispatchError`] and handed to the configured
//! [`ErrorHandler`], which the embedding application may route to logs,
//! alerts or metrics. The only error that escapes to the caller is
//! [`DispatchError::SetupCommands`], returned from `Bot::start`.
//!
//! | Class     | Variant          | Effect                                   |
//! |-----------|------------------|------------------------------------------|
//! | Transport | `Poll`           | reported, retried after a fixed delay    |
//! | Handler   | `Handler`        | reported, event finished, no retry       |
//! | Handler   | `Timeout`        | reported, handler future dropped         |
//! | Panic     | `Panic`          | reported, optional apology reply         |
//! | Startup   | `SetupCommands`  | returned from `start`, nothing runs      |
//! | Reply     | `Reply`          | reported and swallowed                   |
//! | Placement | `Submit`         | reported, event executed inline instead  |

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::api::ApiError;
use crate::task_pool::SubmitError;

/// Every failure the dispatcher can observe at runtime.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `getUpdates` failed for a reason other than cancellation.
    #[error("failed to get updates: {0}")]
    Poll(#[source] ApiError),

    /// Registering the command menu failed. Fatal for `start`.
    #[error("failed to setup commands: {0}")]
    SetupCommands(#[source] ApiError),

    /// A command, fallback or update handler returned an error.
    #[error("handler failed for update {update_id}: {source}")]
    Handler {
        update_id: i64,
        /// Command name when the update was routed as a command.
        command: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    /// A handler panicked; the panic was contained at the event boundary.
    #[error("handler panicked for update {update_id}: {message}")]
    Panic { update_id: i64, message: String },

    /// A handler ran past the configured per-event timeout.
    #[error("handler for update {update_id} timed out after {timeout:?}")]
    Timeout { update_id: i64, timeout: Duration },

    /// Sending a reply (including a panic apology) failed.
    #[error("failed to send reply for update {update_id}: {source}")]
    Reply {
        update_id: i64,
        #[source]
        source: ApiError,
    },

    /// The task pool refused the execution; it ran inline instead.
    #[error("task pool rejected update {update_id}, executing inline: {source}")]
    Submit {
        update_id: i64,
        #[source]
        source: SubmitError,
    },
}

impl DispatchError {
    /// Update the error belongs to, if it is tied to one.
    pub fn update_id(&self) -> Option<i64> {
        match self {
            DispatchError::Poll(_) | DispatchError::SetupCommands(_) => None,
            DispatchError::Handler { update_id, .. }
            | DispatchError::Panic { update_id, .. }
            | DispatchError::Timeout { update_id, .. }
            | DispatchError::Reply { update_id, .. }
            | DispatchError::Submit { update_id, .. } => Some(*update_id),
        }
    }
}

/// Construction-time validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("poll timeout {value}s exceeds the protocol maximum of {max}s")]
    PollTimeoutTooLarge { value: u32, max: u32 },

    #[error("update limit {value} is outside 1..={max}")]
    InvalidLimit { value: u32, max: u32 },

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("command already registered: {name}")]
    DuplicateCommand { name: String },

    /// Names must be 1-32 characters of lowercase letters, digits or `_`.
    #[error("invalid command name: {name:?}")]
    InvalidCommandName { name: String },
}

/// The error-reporting collaborator.
pub type ErrorHandler = Arc<dyn Fn(DispatchError) + Send + Sync>;

/// Reporter used when none is configured: log and move on.
pub(crate) fn log_error_handler() -> ErrorHandler {
    Arc::new(|err: DispatchError| match err.update_id() {
        Some(update_id) => error!(update_id, error = %err, "dispatch error"),
        None => error!(error = %err, "dispatch error"),
    })
}
