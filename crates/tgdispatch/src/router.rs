//! Command registration and per-update routing.
//!
//! Registration happens entirely before the bot starts; during dispatch the
//! registry is shared read-only between workers. A command costs one hash
//! lookup and always resolves to something: either the registered handler or
//! the unrecognized-command fallback.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::Context;
use crate::error::ConfigError;
use crate::handler::{Command, Handler};
use crate::types::{BotCommand, Update};

/// Reply sent by the default fallback for unknown commands.
pub const UNRECOGNIZED_COMMAND_REPLY: &str = "Unrecognized command!!!";

const MAX_COMMAND_NAME_LEN: usize = 32;

// =============================================================================
// Command Registry
// =============================================================================

/// Registered commands, by name and in registration order.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: Vec<Command>,
    by_name: HashMap<String, Arc<dyn Handler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Names must be unique and valid menu entries.
    pub fn register(&mut self, command: Command) -> Result<(), ConfigError> {
        if !is_valid_command_name(&command.name) {
            return Err(ConfigError::InvalidCommandName { name: command.name });
        }
        if self.by_name.contains_key(&command.name) {
            return Err(ConfigError::DuplicateCommand { name: command.name });
        }
        self.by_name
            .insert(command.name.clone(), command.handler().clone());
        self.commands.push(command);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.by_name.get(name)
    }

    /// All commands in registration order, hidden ones included.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Commands that belong in the client menu, in registration order.
    pub fn visible(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(|c| !c.hidden)
    }

    pub fn menu(&self) -> Vec<BotCommand> {
        self.visible().map(Command::to_bot_command).collect()
    }

    /// `"/name - description"` for every visible command.
    pub fn menu_lines(&self) -> Vec<String> {
        self.visible().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands)
            .finish()
    }
}

fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COMMAND_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

// =============================================================================
// Router
// =============================================================================

/// Where an update goes.
pub(crate) enum Route<'a> {
    /// A command; `handler` is the registered one or the fallback.
    Command {
        name: &'a str,
        handler: &'a Arc<dyn Handler>,
    },
    /// A non-command update with a catch-all handler configured.
    Update(&'a Arc<dyn Handler>),
    /// A non-command update and no catch-all handler.
    Ignore,
}

pub(crate) struct Router {
    registry: CommandRegistry,
    fallback: Arc<dyn Handler>,
    updates: Option<Arc<dyn Handler>>,
}

impl Router {
    pub(crate) fn new(
        registry: CommandRegistry,
        fallback: Option<Arc<dyn Handler>>,
        updates: Option<Arc<dyn Handler>>,
    ) -> Self {
        Self {
            registry,
            fallback: fallback.unwrap_or_else(|| Arc::new(UnrecognizedCommand)),
            updates,
        }
    }

    pub(crate) fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Handler for a command name. Total: unknown names get the fallback.
    pub(crate) fn resolve(&self, name: &str) -> &Arc<dyn Handler> {
        self.registry.get(name).unwrap_or(&self.fallback)
    }

    pub(crate) fn route<'a>(&'a self, update: &'a Update) -> Route<'a> {
        if update.is_command() {
            let name = update
                .message
                .as_ref()
                .and_then(|m| m.command())
                .unwrap_or_default();
            return Route::Command {
                name,
                handler: self.resolve(name),
            };
        }
        match &self.updates {
            Some(handler) => Route::Update(handler),
            None => Route::Ignore,
        }
    }
}

/// Default fallback: tell the user the command is unknown.
pub struct UnrecognizedCommand;

#[async_trait]
impl Handler for UnrecognizedCommand {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        ctx.reply_text(UNRECOGNIZED_COMMAND_REPLY).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::testing::{command_update, text_update};
    use futures::FutureExt;

    fn noop() -> impl Handler {
        handler_fn(|_ctx| async { Ok(()) }.boxed())
    }

    fn registry(names: &[&str]) -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        for name in names {
            registry
                .register(Command::new(*name, format!("{name} command"), noop()))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let mut registry = registry(&["start"]);
        let err = registry
            .register(Command::new("start", "again", noop()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateCommand {
                name: "start".into()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_command_names() {
        let mut registry = CommandRegistry::new();
        let too_long = "x".repeat(33);
        for name in ["", "Start", "with space", "/slash", too_long.as_str()] {
            assert!(matches!(
                registry.register(Command::new(name, "bad", noop())),
                Err(ConfigError::InvalidCommandName { .. })
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_menu_preserves_order_and_skips_hidden() {
        let mut registry = registry(&["start", "help"]);
        registry
            .register(Command::new("admin", "secret", noop()).hidden())
            .unwrap();
        registry
            .register(Command::new("stats", "show stats", noop()))
            .unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.menu_lines(),
            vec![
                "/start - start command",
                "/help - help command",
                "/stats - show stats",
            ]
        );
        let menu: Vec<_> = registry.menu().into_iter().map(|c| c.command).collect();
        assert_eq!(menu, vec!["start", "help", "stats"]);
        assert!(registry.get("admin").is_some());
    }

    #[test]
    fn test_route_known_and_unknown_commands() {
        let router = Router::new(registry(&["start"]), None, None);

        let update = command_update(1, 10, "/start now");
        match router.route(&update) {
            Route::Command { name, handler } => {
                assert_eq!(name, "start");
                assert!(Arc::ptr_eq(handler, router.registry().get("start").unwrap()));
            }
            _ => panic!("expected command route"),
        }

        let update = command_update(2, 10, "/unknown");
        match router.route(&update) {
            Route::Command { name, handler } => {
                assert_eq!(name, "unknown");
                assert!(Arc::ptr_eq(handler, &router.fallback));
            }
            _ => panic!("expected fallback route"),
        }
    }

    #[test]
    fn test_route_plain_update() {
        let router = Router::new(registry(&["start"]), None, None);
        let update = text_update(3, 10, "hello");
        assert!(matches!(router.route(&update), Route::Ignore));

        let updates: Arc<dyn Handler> = Arc::new(noop());
        let router = Router::new(registry(&[]), None, Some(updates.clone()));
        match router.route(&update) {
            Route::Update(handler) => assert!(Arc::ptr_eq(handler, &updates)),
            _ => panic!("expected update route"),
        }
    }
}
