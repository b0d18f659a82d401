//! The acquisition loop.
//!
//! A single task long-polls the bot service and feeds the distribution
//! channel. It owns the watermark (the `offset` of the next request): the
//! watermark only moves forward, and only after an update has actually been
//! handed to the channel, so an update is never acknowledged before a worker
//! can see it. Updates below the watermark are re-deliveries and are dropped.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::api::{BotApi, GetUpdates};
use crate::config::BotConfig;
use crate::error::{DispatchError, ErrorHandler};
use crate::types::Update;

pub(crate) struct Poller {
    api: Arc<dyn BotApi>,
    updates: mpsc::Sender<Update>,
    root: CancellationToken,
    on_error: ErrorHandler,
    /// `request.offset` is the watermark.
    request: GetUpdates,
    retry_delay: Duration,
    /// Published copy of the watermark, for observers.
    watermark: Arc<AtomicI64>,
}

impl Poller {
    pub(crate) fn new(
        api: Arc<dyn BotApi>,
        config: &BotConfig,
        updates: mpsc::Sender<Update>,
        root: CancellationToken,
        on_error: ErrorHandler,
        watermark: Arc<AtomicI64>,
    ) -> Self {
        Self {
            api,
            updates,
            root,
            on_error,
            request: GetUpdates {
                offset: watermark.load(Ordering::Acquire),
                limit: config.limit,
                timeout: config.poll_timeout,
                allowed_updates: config.allowed_updates.clone(),
            },
            retry_delay: config.retry_delay,
            watermark,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            offset = self.request.offset,
            limit = self.request.limit,
            poll_timeout = self.request.timeout,
            "update polling started"
        );

        while !self.root.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                fetched = self.api.get_updates(&self.request) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    if !self.enqueue(batch).await {
                        break;
                    }
                }
                Err(err) if err.is_cancelled() => {
                    // Not ours: the adapter gave up on its own request.
                    if !self.root.is_cancelled() && !self.backoff().await {
                        break;
                    }
                }
                Err(err) => {
                    (self.on_error)(DispatchError::Poll(err));
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        info!(offset = self.request.offset, "update polling stopped");
    }

    /// Sleep `retry_delay`. Returns `false` if shutdown interrupted it.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.root.cancelled() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }

    /// Hand a batch to the workers in fetch order.
    ///
    /// Returns `false` if shutdown was observed or no worker is left.
    async fn enqueue(&mut self, batch: Vec<Update>) -> bool {
        if !batch.is_empty() {
            debug!(count = batch.len(), offset = self.request.offset, "fetched updates");
        }

        for update in batch {
            let update_id = update.update_id;
            if update_id < self.request.offset {
                trace!(update_id, offset = self.request.offset, "dropping re-delivered update");
                continue;
            }

            let sent = tokio::select! {
                biased;
                _ = self.root.cancelled() => return false,
                sent = self.updates.send(update) => sent,
            };
            if sent.is_err() {
                return false;
            }
            self.advance(update_id + 1);
        }
        true
    }

    fn advance(&mut self, offset: i64) {
        self.request.offset = offset;
        self.watermark.store(offset, Ordering::Release);
    }
}
