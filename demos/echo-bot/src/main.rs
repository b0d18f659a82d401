//! # Echo Bot Example
//!
//! Runs a small bot against the in-memory scripted API, so it works without
//! a token or network access. Swap `ScriptedApi` for a real `BotApi` client
//! and nothing else changes.
//!
//! ```text
//! RUST_LOG=debug cargo run -p echo-bot-example
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tgdispatch_core::testing::{callback_update, command_update, text_update, ScriptedApi};
use tgdispatch_core::{
    handler_fn, BotBuilder, Command, Context, DispatchError, Handler, ParseMode, Update,
    UpdateKind,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Handlers
// ============================================================================

/// Repeats any plain text back to the sender.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let Some(text) = ctx.message().and_then(|m| m.text.as_deref()) else {
            return Ok(());
        };
        ctx.reply_text(format!("you said: {text}")).await?;
        Ok(())
    }
}

/// `/help` lists the visible commands, filled in once the bot is built.
#[derive(Clone, Default)]
struct Help {
    lines: Arc<OnceLock<Vec<String>>>,
}

#[async_trait]
impl Handler for Help {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let lines = self.lines.get().map(|l| l.join("\n")).unwrap_or_default();
        ctx.reply_markdown(lines).await?;
        Ok(())
    }
}

/// `/crash` exercises panic recovery.
struct Crash;

#[async_trait]
impl Handler for Crash {
    async fn handle(&self, _ctx: &Context) -> Result<()> {
        panic!("crash requested");
    }
}

fn commands() -> Vec<Command> {
    let start = Command::new(
        "start",
        "say hello",
        handler_fn(|ctx| {
            async move {
                let name = ctx
                    .sent_from()
                    .map(|u| u.first_name.clone())
                    .unwrap_or_else(|| "stranger".to_string());
                ctx.reply_with(format!("*hello, {name}*"), |m| {
                    m.parse_mode(ParseMode::MarkdownV2)
                })
                .await?;
                anyhow::Ok(())
            }
            .boxed()
        }),
    );
    let shout = Command::new(
        "shout",
        "repeat the arguments in capitals",
        handler_fn(|ctx| {
            async move {
                ctx.reply_text(ctx.command_args().to_uppercase()).await?;
                anyhow::Ok(())
            }
            .boxed()
        }),
    );
    vec![start, shout, Command::new("crash", "panic on purpose", Crash).hidden()]
}

// ============================================================================
// Script
// ============================================================================

/// An update as it would arrive on the wire.
fn raw_update() -> Result<Update> {
    let raw = r#"{
        "update_id": 7,
        "message": {
            "message_id": 70,
            "from": { "id": 1, "is_bot": false, "first_name": "Ada" },
            "chat": { "id": 500, "type": "private" },
            "date": 1700000000,
            "text": "/shout@echo_bot rust is fun",
            "entities": [{ "type": "bot_command", "offset": 0, "length": 15 }]
        }
    }"#;
    Ok(serde_json::from_str(raw)?)
}

fn script(api: &ScriptedApi) -> Result<()> {
    api.push_batch(vec![
        command_update(1, 500, "/start"),
        command_update(2, 500, "/help"),
        text_update(3, 500, "hello there"),
    ])
    // A re-delivery of update 3 is dropped by the polling loop.
    .push_batch(vec![
        text_update(3, 500, "hello there"),
        command_update(4, 500, "/unknown"),
        callback_update(5, 500, "button:1"),
        command_update(6, 500, "/crash"),
    ])
    .push_batch(vec![raw_update()?]);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api = Arc::new(ScriptedApi::new());
    script(&api)?;

    let help = Help::default();
    let mut builder = BotBuilder::new(api.clone())
        .with_workers(2)
        .with_timeout(Duration::from_secs(5))
        .with_allowed_updates([UpdateKind::Message, UpdateKind::CallbackQuery])
        .with_updates_handler(Echo)
        .with_error_handler(|err: DispatchError| match err.update_id() {
            Some(update_id) => warn!(update_id, error = %err, "update failed"),
            None => warn!(error = %err, "bot error"),
        })
        .with_panic_handler(|message| format!("something broke ({message}), try again later"))
        .with_command(Command::new("help", "list commands", help.clone()));

    for command in commands() {
        builder = builder.with_command(command);
    }
    let bot = builder.build()?;
    let _ = help.lines.set(bot.registry().menu_lines());

    let shutdown = bot.shutdown_token();
    let handle = bot.start().await?;

    if !api.wait_for_requests(4, Duration::from_secs(5)).await {
        warn!("script did not drain in time");
    }
    api.wait_for_sent(7, Duration::from_secs(2)).await;

    shutdown.cancel();
    handle.stop().await;

    for message in api.sent() {
        info!(chat_id = message.chat_id, text = %message.text, "sent");
    }
    info!(offset = handle.offset(), "echo bot finished");

    Ok(())
}
