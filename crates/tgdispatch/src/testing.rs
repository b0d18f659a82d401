//! Test doubles for driving a bot without a network.
//!
//! Enable with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tgdispatch-core = { path = "...", features = ["testing"] }
//! ```
//!
//! [`ScriptedApi`] replays queued `getUpdates` results in order and records
//! everything the dispatcher sends. Once the script runs out it behaves like
//! an idle long poll: a short sleep, then an empty batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::api::{ApiError, BotApi, GetUpdates};
use crate::error::{DispatchError, ErrorHandler};
use crate::types::{BotCommand, CallbackQuery, Chat, Message, MessageEntity, SendMessage, Update, User};

const IDLE_POLL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Scripted API
// =============================================================================

/// In-memory [`BotApi`] with a scripted sequence of fetch results.
pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<Vec<Update>, ApiError>>>,
    requests: Mutex<Vec<GetUpdates>>,
    sent: Mutex<Vec<SendMessage>>,
    menus: Mutex<Vec<Vec<BotCommand>>>,
    fail_menu: AtomicBool,
    fail_send: AtomicBool,
    next_message_id: AtomicI64,
    activity: Notify,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            menus: Mutex::new(Vec::new()),
            fail_menu: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            next_message_id: AtomicI64::new(1),
            activity: Notify::new(),
        }
    }

    /// Queue a batch for a future `getUpdates` call.
    pub fn push_batch(&self, batch: Vec<Update>) -> &Self {
        lock(&self.script).push_back(Ok(batch));
        self
    }

    /// Queue a failed `getUpdates` call.
    pub fn push_error(&self, err: ApiError) -> &Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    pub fn fail_set_my_commands(&self) -> &Self {
        self.fail_menu.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_send_message(&self) -> &Self {
        self.fail_send.store(true, Ordering::SeqCst);
        self
    }

    /// Every `getUpdates` request seen so far.
    pub fn requests(&self) -> Vec<GetUpdates> {
        lock(&self.requests).clone()
    }

    /// Script entries not yet consumed.
    pub fn pending(&self) -> usize {
        lock(&self.script).len()
    }

    pub fn sent(&self) -> Vec<SendMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|m| m.text.clone()).collect()
    }

    /// Every command menu registered, in call order.
    pub fn menus(&self) -> Vec<Vec<BotCommand>> {
        lock(&self.menus).clone()
    }

    /// Wait until at least `count` messages were sent.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || lock(&self.sent).len() >= count)
            .await
    }

    /// Wait until the script is consumed and at least `requests` fetches happened.
    pub async fn wait_for_requests(&self, requests: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            lock(&self.script).is_empty() && lock(&self.requests).len() >= requests
        })
        .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.activity.notified();
                if done() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl BotApi for ScriptedApi {
    async fn get_updates(&self, request: &GetUpdates) -> Result<Vec<Update>, ApiError> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.script).pop_front();
        self.activity.notify_waiters();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(IDLE_POLL).await;
                Ok(Vec::new())
            }
        }
    }

    async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), ApiError> {
        if self.fail_menu.load(Ordering::SeqCst) {
            return Err(ApiError::Telegram {
                code: 401,
                description: "Unauthorized".to_string(),
            });
        }
        lock(&self.menus).push(commands.to_vec());
        Ok(())
    }

    async fn send_message(&self, message: SendMessage) -> Result<Message, ApiError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ApiError::Telegram {
                code: 400,
                description: "Bad Request: chat not found".to_string(),
            });
        }
        let reply = Message {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            chat: Chat {
                id: message.chat_id,
                kind: "private".to_string(),
                ..Chat::default()
            },
            text: Some(message.text.clone()),
            ..Message::default()
        };
        lock(&self.sent).push(message);
        self.activity.notify_waiters();
        Ok(reply)
    }
}

// =============================================================================
// Update builders
// =============================================================================

fn user() -> User {
    User {
        id: 1000,
        is_bot: false,
        first_name: "Tester".to_string(),
        username: Some("tester".to_string()),
    }
}

fn private_chat(chat_id: i64) -> Chat {
    Chat {
        id: chat_id,
        kind: "private".to_string(),
        ..Chat::default()
    }
}

fn text_message(message_id: i64, chat_id: i64, text: &str) -> Message {
    Message {
        message_id,
        from: Some(user()),
        chat: private_chat(chat_id),
        date: 1_700_000_000,
        text: Some(text.to_string()),
        entities: Vec::new(),
    }
}

/// A message whose first word (e.g. `/start@my_bot`) is a command entity.
pub fn command_update(update_id: i64, chat_id: i64, text: &str) -> Update {
    let mut message = text_message(update_id, chat_id, text);
    let command_len = text
        .split_whitespace()
        .next()
        .map(|word| word.encode_utf16().count())
        .unwrap_or(0);
    message.entities = vec![MessageEntity::bot_command(0, command_len)];
    Update {
        update_id,
        message: Some(message),
        ..Update::default()
    }
}

pub fn text_update(update_id: i64, chat_id: i64, text: &str) -> Update {
    Update {
        update_id,
        message: Some(text_message(update_id, chat_id, text)),
        ..Update::default()
    }
}

pub fn edited_text_update(update_id: i64, chat_id: i64, text: &str) -> Update {
    Update {
        update_id,
        edited_message: Some(text_message(update_id, chat_id, text)),
        ..Update::default()
    }
}

/// A button press on a message previously sent to `chat_id`.
pub fn callback_update(update_id: i64, chat_id: i64, data: &str) -> Update {
    Update {
        update_id,
        callback_query: Some(CallbackQuery {
            id: format!("cb-{update_id}"),
            from: user(),
            message: Some(text_message(update_id, chat_id, "menu")),
            data: Some(data.to_string()),
        }),
        ..Update::default()
    }
}

// =============================================================================
// Synchronisation helpers
// =============================================================================

/// Countdown latch for waiting on handler invocations.
pub struct Latch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Latch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        })
    }

    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait for the count to reach zero. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.remaining() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Collects everything passed to the error handler.
#[derive(Default)]
pub struct ErrorLog {
    errors: Mutex<Vec<DispatchError>>,
    notify: Notify,
}

impl ErrorLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An error handler that records into this log.
    pub fn handler(self: &Arc<Self>) -> ErrorHandler {
        let log = self.clone();
        Arc::new(move |err: DispatchError| {
            lock(&log.errors).push(err);
            log.notify.notify_waiters();
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.errors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display strings of every recorded error.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.errors).iter().map(ToString::to_string).collect()
    }

    pub fn count(&self, predicate: impl Fn(&DispatchError) -> bool) -> usize {
        lock(&self.errors).iter().filter(|e| predicate(e)).count()
    }

    /// Wait until at least `count` errors were recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
