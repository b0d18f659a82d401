//! Tunables for a bot instance.
//!
//! [`BotConfig`] is assembled by `BotBuilder` and frozen once the bot is
//! built. Cross-field constraints are checked by [`BotConfig::validate`]
//! instead of being clamped silently.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::ConfigError;

/// Protocol maximum for the long-poll timeout, in seconds.
pub const MAX_POLL_TIMEOUT_SECS: u32 = 50;

pub const DEFAULT_POLL_TIMEOUT_SECS: u32 = MAX_POLL_TIMEOUT_SECS;

/// Protocol maximum (and default) for updates per fetch.
pub const MAX_UPDATE_LIMIT: u32 = 100;

/// Delay before retrying a failed fetch.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Per-event handler timeout. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Long-poll timeout passed to every fetch, in seconds.
    pub poll_timeout: u32,
    /// Number of concurrent consumers.
    pub workers: usize,
    /// Capacity of the distribution channel. Zero means "same as `limit`".
    pub buffer_size: usize,
    /// Maximum updates per fetch.
    pub limit: u32,
    /// Update kinds to request. Empty means whatever the service defaults to.
    pub allowed_updates: Vec<String>,
    /// Register the visible commands as the client menu on start.
    pub auto_setup_commands: bool,
    pub retry_delay: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT_SECS,
            workers: default_workers(),
            buffer_size: 0,
            limit: MAX_UPDATE_LIMIT,
            allowed_updates: Vec::new(),
            auto_setup_commands: true,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl BotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout > MAX_POLL_TIMEOUT_SECS {
            return Err(ConfigError::PollTimeoutTooLarge {
                value: self.poll_timeout,
                max: MAX_POLL_TIMEOUT_SECS,
            });
        }
        if self.limit == 0 || self.limit > MAX_UPDATE_LIMIT {
            return Err(ConfigError::InvalidLimit {
                value: self.limit,
                max: MAX_UPDATE_LIMIT,
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }

    /// Channel capacity after applying the `limit` fallback.
    pub fn channel_capacity(&self) -> usize {
        if self.buffer_size == 0 {
            self.limit as usize
        } else {
            self.buffer_size
        }
    }

    /// The timeout, with a zero duration treated as "none".
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// One worker per available execution unit.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
