//! Bot construction and lifecycle.
//!
//! ```text
//! Bot::builder(api)            BotBuilder   with_* calls, then build()
//!        │
//!        ▼
//! Bot::start().await  ──►  BotHandle   (Running)
//!        │                    │
//!        │                    ├── stop().await   cancel, drain, Stopped
//!        │                    └── wait().await   block until workers exit
//!        ▼
//! Bot::run().await      start + wait + drain
//! ```
//!
//! Shutdown is driven entirely by the root [`CancellationToken`]. Cancelling
//! the parent token passed to [`BotBuilder::with_cancellation`] has the same
//! effect as calling [`BotHandle::stop`].

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::BotApi;
use crate::config::BotConfig;
use crate::context::ContextPool;
use crate::error::{log_error_handler, ConfigError, DispatchError, ErrorHandler};
use crate::handler::{default_panic_handler, Command, Handler, PanicHandler};
use crate::poller::Poller;
use crate::router::{CommandRegistry, Router};
use crate::task_pool::TaskPool;
use crate::types::UpdateKind;
use crate::worker::{run_worker, ActiveWorker, Dispatcher};

// =============================================================================
// Lifecycle State
// =============================================================================

/// Where a bot is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Configured = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Configured,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

// =============================================================================
// Bot
// =============================================================================

/// A configured, not yet running bot.
///
/// Everything here is fixed at build time: the command set, the handlers
/// and the configuration cannot change once the bot is started.
pub struct Bot {
    api: Arc<dyn BotApi>,
    config: BotConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Bot {
    /// Create a new bot builder.
    pub fn builder<A: BotApi>(api: A) -> BotBuilder {
        BotBuilder::new(Arc::new(api))
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Commands shown in the client menu, in registration order.
    pub fn commands(&self) -> Vec<&Command> {
        self.dispatcher.router.registry().visible().collect()
    }

    /// All registered commands, hidden ones included.
    pub fn registry(&self) -> &CommandRegistry {
        self.dispatcher.router.registry()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::Configured
    }

    /// The root token. Cancelling it shuts the bot down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.dispatcher.root.clone()
    }

    /// Start polling and processing updates in the background.
    ///
    /// With auto setup enabled the visible commands are registered as the
    /// client menu first; a failure there is fatal and nothing is spawned.
    pub async fn start(self) -> Result<BotHandle, DispatchError> {
        if self.config.auto_setup_commands {
            let menu = self.dispatcher.router.registry().menu();
            self.api
                .set_my_commands(&menu)
                .await
                .map_err(DispatchError::SetupCommands)?;
            info!(commands = menu.len(), "command menu registered");
        }

        let capacity = self.config.channel_capacity();
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let active = Arc::new(AtomicUsize::new(0));
        let workers = TaskTracker::new();
        for worker in 0..self.config.workers {
            // Counted before spawning so the gauge is exact once start returns.
            let guard = ActiveWorker::enter(&active);
            workers.spawn(run_worker(self.dispatcher.clone(), worker, rx.clone(), guard));
        }
        workers.close();

        let watermark = Arc::new(AtomicI64::new(0));
        let poller = TaskTracker::new();
        poller.spawn(
            Poller::new(
                self.api.clone(),
                &self.config,
                tx,
                self.dispatcher.root.clone(),
                self.dispatcher.on_error.clone(),
                watermark.clone(),
            )
            .run(),
        );
        poller.close();

        info!(
            workers = self.config.workers,
            buffer = capacity,
            timeout = ?self.dispatcher.timeout,
            "bot started"
        );

        Ok(BotHandle {
            dispatcher: self.dispatcher,
            state: Arc::new(AtomicU8::new(LifecycleState::Running as u8)),
            active,
            watermark,
            workers,
            poller,
        })
    }

    /// Start, then block until every worker has exited and in-flight work
    /// has drained. Returns once the root token is cancelled.
    pub async fn run(self) -> Result<(), DispatchError> {
        let handle = self.start().await?;
        handle.wait().await;
        handle.stop().await;
        Ok(())
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Bot Handle
// =============================================================================

/// Handle to a running bot.
///
/// Dropping the handle does not stop the bot; use [`stop`](Self::stop) or
/// cancel the shutdown token.
pub struct BotHandle {
    pub(crate) dispatcher: Arc<Dispatcher>,
    state: Arc<AtomicU8>,
    active: Arc<AtomicUsize>,
    watermark: Arc<AtomicI64>,
    workers: TaskTracker,
    poller: TaskTracker,
}

impl BotHandle {
    /// A running bot whose root token was cancelled from outside reports
    /// `Stopping` until [`stop`](Self::stop) completes.
    pub fn state(&self) -> LifecycleState {
        match LifecycleState::from_u8(self.state.load(Ordering::Acquire)) {
            LifecycleState::Running if self.dispatcher.root.is_cancelled() => {
                LifecycleState::Stopping
            }
            state => state,
        }
    }

    /// Workers currently consuming from the channel.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// The next update id the polling loop will ask for.
    pub fn offset(&self) -> i64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.dispatcher.root.clone()
    }

    /// Stop the bot and wait for it to drain.
    ///
    /// Cancels the root token, then waits for the workers (and whatever
    /// update each is handling), the polling loop, and executions placed on
    /// a task pool. Safe to call more than once.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(offset = self.offset(), "stopping bot");
        }

        self.dispatcher.root.cancel();
        self.workers.wait().await;
        self.poller.wait().await;
        self.dispatcher.executions.close();
        self.dispatcher.executions.wait().await;

        if self.state.swap(LifecycleState::Stopped as u8, Ordering::AcqRel)
            != LifecycleState::Stopped as u8
        {
            info!(offset = self.offset(), "bot stopped");
        }
    }

    /// Block until every worker has exited.
    pub async fn wait(&self) {
        self.workers.wait().await;
    }
}

impl std::fmt::Debug for BotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotHandle")
            .field("state", &self.state())
            .field("active_workers", &self.active_workers())
            .field("offset", &self.offset())
            .finish()
    }
}

// =============================================================================
// Bot Builder
// =============================================================================

/// Builder for configuring a bot.
///
/// # Example
///
/// ```ignore
/// let bot = Bot::builder(client)
///     .with_workers(4)
///     .with_timeout(Duration::from_secs(10))
///     .with_command(Command::new("start", "say hello", StartHandler))
///     .with_updates_handler(EchoHandler)
///     .build()?;
///
/// bot.run().await?;
/// ```
pub struct BotBuilder {
    api: Arc<dyn BotApi>,
    config: BotConfig,
    commands: Vec<Command>,
    task_pool: Option<Arc<dyn TaskPool>>,
    fallback: Option<Arc<dyn Handler>>,
    updates: Option<Arc<dyn Handler>>,
    on_error: Option<ErrorHandler>,
    on_panic: Option<PanicHandler>,
    parent: Option<CancellationToken>,
}

impl BotBuilder {
    /// Create a builder around an already shared API client.
    pub fn new(api: Arc<dyn BotApi>) -> Self {
        Self {
            api,
            config: BotConfig::default(),
            commands: Vec::new(),
            task_pool: None,
            fallback: None,
            updates: None,
            on_error: None,
            on_panic: None,
            parent: None,
        }
    }

    /// Replace the whole configuration at once.
    pub fn with_config(mut self, config: BotConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound every handler invocation. A zero duration disables the bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Long-poll timeout in seconds, at most 50.
    pub fn with_poll_timeout(mut self, seconds: u32) -> Self {
        self.config.poll_timeout = seconds;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Run executions on `pool` instead of on the worker itself.
    pub fn with_task_pool<P: TaskPool>(mut self, pool: Arc<P>) -> Self {
        self.task_pool = Some(pool);
        self
    }

    /// Handler for commands nobody registered.
    pub fn with_unrecognized_command_handler(mut self, handler: impl Handler) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(DispatchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn with_auto_setup_commands(mut self, enabled: bool) -> Self {
        self.config.auto_setup_commands = enabled;
        self
    }

    /// Capacity of the distribution channel. Zero means "same as the limit".
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Maximum updates per fetch, 1 to 100.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.config.limit = limit;
        self
    }

    /// Catch-all handler for every update that is not a command.
    pub fn with_updates_handler(mut self, handler: impl Handler) -> Self {
        self.updates = Some(Arc::new(handler));
        self
    }

    /// Map a recovered panic message to the reply text. Return an empty
    /// string to send nothing.
    pub fn with_panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.on_panic = Some(Arc::new(handler));
        self
    }

    /// Restrict fetches to these update kinds.
    pub fn with_allowed_updates<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = UpdateKind>,
    {
        self.config.allowed_updates = kinds
            .into_iter()
            .map(|kind| kind.as_str().to_string())
            .collect();
        self
    }

    /// Tie the bot's lifetime to `parent`: cancelling it stops the bot.
    pub fn with_cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Delay between a failed fetch and the next attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Validate the configuration and the command set, then assemble the bot.
    pub fn build(self) -> Result<Bot, ConfigError> {
        self.config.validate()?;

        let mut registry = CommandRegistry::new();
        for command in self.commands {
            registry.register(command)?;
        }
        if registry.is_empty() && self.updates.is_none() {
            warn!("bot has no commands and no updates handler");
        }

        let root = match self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let contexts = Arc::new(ContextPool::new(
            self.api.clone(),
            root.clone(),
            self.config.workers,
        ));

        let dispatcher = Dispatcher {
            router: Router::new(registry, self.fallback, self.updates),
            contexts,
            task_pool: self.task_pool,
            executions: TaskTracker::new(),
            on_error: self.on_error.unwrap_or_else(log_error_handler),
            on_panic: self.on_panic.unwrap_or_else(default_panic_handler),
            timeout: self.config.handler_timeout(),
            root,
        };

        Ok(Bot {
            api: self.api,
            config: self.config,
            dispatcher: Arc::new(dispatcher),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::context::Context;
    use crate::handler::handler_fn;
    use crate::router::UNRECOGNIZED_COMMAND_REPLY;
    use crate::testing::{
        callback_update, command_update, edited_text_update, text_update, ErrorLog, Latch,
        ScriptedApi,
    };
    use crate::types::BotCommand;
    use futures::FutureExt;
    use std::sync::Mutex as StdMutex;

    const WAIT: Duration = Duration::from_secs(2);

    fn builder(api: &Arc<ScriptedApi>) -> BotBuilder {
        BotBuilder::new(api.clone())
            .with_workers(2)
            .with_retry_delay(Duration::from_millis(10))
    }

    fn noop() -> impl Handler {
        handler_fn(|_ctx| async { Ok(()) }.boxed())
    }

    /// Counts down the latch on every call and remembers what it saw.
    struct Recorder {
        latch: Arc<Latch>,
        seen: Arc<StdMutex<Vec<(i64, String)>>>,
    }

    impl Recorder {
        fn new(count: usize) -> (Self, Arc<Latch>, Arc<StdMutex<Vec<(i64, String)>>>) {
            let latch = Latch::new(count);
            let seen = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    latch: latch.clone(),
                    seen: seen.clone(),
                },
                latch,
                seen,
            )
        }
    }

    #[async_trait::async_trait]
    impl Handler for Recorder {
        async fn handle(&self, ctx: &Context) -> anyhow::Result<()> {
            let id = ctx.update_id().unwrap_or_default();
            self.seen
                .lock()
                .unwrap()
                .push((id, ctx.command_args().to_string()));
            self.latch.count_down();
            Ok(())
        }
    }

    struct Fails;

    #[async_trait::async_trait]
    impl Handler for Fails {
        async fn handle(&self, _ctx: &Context) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    // ==========================================================================
    // Build
    // ==========================================================================

    #[test]
    fn test_build_rejects_invalid_config() {
        let api = Arc::new(ScriptedApi::new());
        assert!(matches!(
            builder(&api).with_poll_timeout(60).build(),
            Err(ConfigError::PollTimeoutTooLarge { value: 60, max: 50 })
        ));
        assert!(matches!(
            builder(&api).with_workers(0).build(),
            Err(ConfigError::ZeroWorkers)
        ));
        assert!(matches!(
            builder(&api).with_limit(101).build(),
            Err(ConfigError::InvalidLimit { value: 101, .. })
        ));
    }

    #[test]
    fn test_build_rejects_duplicate_commands() {
        let api = Arc::new(ScriptedApi::new());
        let err = builder(&api)
            .with_command(Command::new("start", "one", noop()))
            .with_command(Command::new("start", "two", noop()))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateCommand {
                name: "start".into()
            }
        );
    }

    #[test]
    fn test_build_applies_options() {
        let api = Arc::new(ScriptedApi::new());
        let bot = builder(&api)
            .with_workers(1)
            .with_limit(10)
            .with_timeout(Duration::ZERO)
            .with_allowed_updates([UpdateKind::Message, UpdateKind::CallbackQuery])
            .with_command(Command::new("start", "begin", noop()))
            .with_command(Command::new("debug", "internal", noop()).hidden())
            .build()
            .unwrap();

        assert_eq!(bot.config().workers, 1);
        assert_eq!(bot.config().channel_capacity(), 10);
        assert_eq!(
            bot.config().allowed_updates,
            vec!["message".to_string(), "callback_query".to_string()]
        );
        assert!(bot.dispatcher.timeout.is_none());
        assert_eq!(bot.state(), LifecycleState::Configured);
        let visible: Vec<_> = bot.commands().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(visible, vec!["start"]);
        assert_eq!(bot.registry().len(), 2);
    }

    // ==========================================================================
    // Startup
    // ==========================================================================

    #[tokio::test]
    async fn test_start_registers_visible_menu() {
        let api = Arc::new(ScriptedApi::new());
        let handle = builder(&api)
            .with_command(Command::new("start", "begin", noop()))
            .with_command(Command::new("admin", "secret", noop()).hidden())
            .with_command(Command::new("help", "usage", noop()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(
            api.menus(),
            vec![vec![
                BotCommand {
                    command: "start".into(),
                    description: "begin".into(),
                },
                BotCommand {
                    command: "help".into(),
                    description: "usage".into(),
                },
            ]]
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_auto_setup_can_be_disabled() {
        let api = Arc::new(ScriptedApi::new());
        api.fail_set_my_commands();
        let handle = builder(&api)
            .with_auto_setup_commands(false)
            .with_command(Command::new("start", "begin", noop()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(api.menus().is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal() {
        let api = Arc::new(ScriptedApi::new());
        api.fail_set_my_commands();
        let bot = builder(&api)
            .with_command(Command::new("start", "begin", noop()))
            .build()
            .unwrap();
        let token = bot.shutdown_token();

        let err = bot.start().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SetupCommands(ApiError::Telegram { code: 401, .. })
        ));

        // No loop was started.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(api.requests().is_empty());
        assert!(!token.is_cancelled());
    }

    // ==========================================================================
    // Routing
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_command_routed_exactly_once_with_args() {
        let api = Arc::new(ScriptedApi::new());
        api.push_batch(vec![
            command_update(1, 10, "/start hello world"),
            command_update(2, 10, "/unknown"),
        ]);

        let (start, start_latch, seen) = Recorder::new(1);
        let (fallback, fallback_latch, missed) = Recorder::new(1);
        let handle = builder(&api)
            .with_command(Command::new("start", "begin", start))
            .with_unrecognized_command_handler(fallback)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(start_latch.wait(WAIT).await);
        assert!(fallback_latch.wait(WAIT).await);
        handle.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec![(1, "hello world".to_string())]);
        assert_eq!(missed.lock().unwrap().len(), 1);
        assert_eq!(missed.lock().unwrap()[0].0, 2);
        assert!(api.sent().is_empty());
    }

    #[tokio::test]
    async fn test_default_fallback_replies() {
        let api = Arc::new(ScriptedApi::new());
        api.push_batch(vec![command_update(1, 42, "/nope")]);
        let handle = builder(&api).build().unwrap().start().await.unwrap();

        assert!(api.wait_for_sent(1, WAIT).await);
        handle.stop().await;

        let sent = api.sent();
        assert_eq!(sent[0].chat_id, 42);
        assert_eq!(sent[0].text, UNRECOGNIZED_COMMAND_REPLY);
    }

    #[tokio::test]
    async fn test_non_commands_go_to_updates_handler() {
        let api = Arc::new(ScriptedApi::new());
        api.push_batch(vec![
            text_update(1, 1, "hello"),
            edited_text_update(2, 1, "/start in an edit"),
            callback_update(3, 1, "button"),
        ]);

        let (updates, latch, seen) = Recorder::new(3);
        let (start, _, started) = Recorder::new(1);
        let handle = builder(&api)
            .with_command(Command::new("start", "begin", start))
            .with_updates_handler(updates)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(latch.wait(WAIT).await);
        handle.stop().await;

        let mut ids: Vec<_> = seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_commands_ignored_without_handler() {
        let api = Arc::new(ScriptedApi::new());
        let errors = ErrorLog::new();
        api.push_batch(vec![text_update(1, 1, "hello")]);
        let report = errors.handler();
        let handle = builder(&api)
            .with_error_handler(move |err| report(err))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(api.wait_for_requests(2, WAIT).await);
        handle.stop().await;
        assert!(api.sent().is_empty());
        assert!(errors.is_empty());
        assert_eq!(handle.offset(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let api = Arc::new(ScriptedApi::new());
        api.push_batch(vec![command_update(7, 1, "/save"), command_update(8, 1, "/ok")]);
        let errors = ErrorLog::new();
        let report = errors.handler();
        let (recorder, latch, seen) = Recorder::new(1);
        let handle = builder(&api)
            .with_workers(1)
            .with_command(Command::new("save", "persist", Fails))
            .with_command(Command::new("ok", "succeeds", recorder))
            .with_error_handler(move |err| report(err))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(errors.wait_for(1, WAIT).await);
        // The same worker moves on to the next update.
        assert!(latch.wait(WAIT).await);
        assert_eq!(handle.active_workers(), 1);
        handle.stop().await;
        assert_eq!(seen.lock().unwrap().clone(), vec![(8, String::new())]);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.count(|e| matches!(
                e,
                DispatchError::Handler { update_id: 7, command: Some(c), .. } if c == "save"
            )),
            1
        );
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_count_while_running_and_after_stop() {
        for workers in [1, 3, 8] {
            let api = Arc::new(ScriptedApi::new());
            let handle = builder(&api)
                .with_workers(workers)
                .build()
                .unwrap()
                .start()
                .await
                .unwrap();

            assert_eq!(handle.state(), LifecycleState::Running);
            assert_eq!(handle.active_workers(), workers);

            handle.stop().await;
            assert_eq!(handle.state(), LifecycleState::Stopped);
            assert_eq!(handle.active_workers(), 0);

            // Idempotent.
            handle.stop().await;
            assert_eq!(handle.state(), LifecycleState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_run() {
        let api = Arc::new(ScriptedApi::new());
        let parent = CancellationToken::new();
        let bot = builder(&api)
            .with_cancellation(parent.clone())
            .build()
            .unwrap();
        let run = tokio::spawn(bot.run());

        assert!(api.wait_for_requests(1, WAIT).await);
        parent.cancel();
        let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancellation_is_visible_in_state() {
        let api = Arc::new(ScriptedApi::new());
        let parent = CancellationToken::new();
        let handle = builder(&api)
            .with_cancellation(parent.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert_eq!(handle.state(), LifecycleState::Running);

        parent.cancel();
        tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Stopping);
        assert_eq!(handle.active_workers(), 0);

        handle.stop().await;
        assert_eq!(handle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_handler() {
        let api = Arc::new(ScriptedApi::new());
        api.push_batch(vec![command_update(1, 1, "/slow")]);

        let entered = Latch::new(1);
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (gate, done) = (entered.clone(), finished.clone());
        let handle = builder(&api)
            .with_command(Command::new(
                "slow",
                "takes a while",
                handler_fn(move |_ctx| {
                    let (gate, done) = (gate.clone(), done.clone());
                    async move {
                        gate.count_down();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        done.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                }),
            ))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(entered.wait(WAIT).await);
        handle.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_token_is_child_of_parent() {
        let api = Arc::new(ScriptedApi::new());
        let parent = CancellationToken::new();
        let bot = builder(&api)
            .with_cancellation(parent.clone())
            .build()
            .unwrap();
        let token = bot.shutdown_token();
        let handle = bot.start().await.unwrap();

        handle.stop().await;
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
