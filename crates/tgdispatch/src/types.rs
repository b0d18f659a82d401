//! Wire types for inbound updates and outbound messages.
//!
//! Only the fields the dispatcher and the context helpers actually read are
//! modelled. Everything deserializes from the service's JSON shape, so
//! unknown fields are ignored and optional payloads default to `None`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Inbound
// =============================================================================

/// One inbound occurrence delivered by `getUpdates`.
///
/// `update_id` is strictly increasing across deliveries, which is what the
/// polling loop uses as its watermark. At most one payload field is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_channel_post: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
}

impl Update {
    /// The message-shaped payload, checked in delivery-kind order:
    /// message, edited message, channel post, edited channel post.
    pub fn message_like(&self) -> Option<&Message> {
        self.message
            .as_ref()
            .or(self.edited_message.as_ref())
            .or(self.channel_post.as_ref())
            .or(self.edited_channel_post.as_ref())
    }

    /// Which payload this update carries.
    pub fn kind(&self) -> UpdateKind {
        if self.message.is_some() {
            UpdateKind::Message
        } else if self.edited_message.is_some() {
            UpdateKind::EditedMessage
        } else if self.channel_post.is_some() {
            UpdateKind::ChannelPost
        } else if self.edited_channel_post.is_some() {
            UpdateKind::EditedChannelPost
        } else if self.callback_query.is_some() {
            UpdateKind::CallbackQuery
        } else {
            UpdateKind::Unknown
        }
    }

    /// True only for a fresh `message` that starts with a bot command.
    ///
    /// Edited messages and channel posts are never routed as commands.
    pub fn is_command(&self) -> bool {
        self.message.as_ref().is_some_and(Message::is_command)
    }

    /// The user that caused this update, if any.
    pub fn sent_from(&self) -> Option<&User> {
        if let Some(query) = &self.callback_query {
            return Some(&query.from);
        }
        self.message_like().and_then(|m| m.from.as_ref())
    }

    /// The chat this update belongs to, if any.
    pub fn from_chat(&self) -> Option<&Chat> {
        if let Some(message) = self.message_like() {
            return Some(&message.chat);
        }
        self.callback_query
            .as_ref()
            .and_then(|q| q.message.as_ref())
            .map(|m| &m.chat)
    }
}

/// Update kinds as named by the `allowed_updates` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    CallbackQuery,
    Unknown,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Message => "message",
            UpdateKind::EditedMessage => "edited_message",
            UpdateKind::ChannelPost => "channel_post",
            UpdateKind::EditedChannelPost => "edited_channel_post",
            UpdateKind::CallbackQuery => "callback_query",
            UpdateKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    pub chat: Chat,
    /// Unix timestamp (seconds).
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
}

impl Message {
    /// A message is a command when its first entity is a `bot_command`
    /// starting at offset zero.
    pub fn is_command(&self) -> bool {
        self.entities
            .first()
            .is_some_and(|e| e.offset == 0 && e.is_bot_command())
    }

    /// The command without the leading slash, including any `@botname`.
    pub fn command_with_at(&self) -> Option<&str> {
        let (text, end) = self.command_span()?;
        text.get(1..end)
    }

    /// The command name without the leading slash or `@botname` suffix.
    pub fn command(&self) -> Option<&str> {
        self.command_with_at()
            .map(|c| c.split_once('@').map_or(c, |(name, _)| name))
    }

    /// Everything after the command, minus one separating whitespace.
    ///
    /// Empty when the message is not a command or has no arguments.
    pub fn command_args(&self) -> &str {
        let Some((text, end)) = self.command_span() else {
            return "";
        };
        let rest = &text[end..];
        rest.strip_prefix(char::is_whitespace).unwrap_or(rest)
    }

    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.date, 0)
    }

    /// Text plus the byte offset where the command entity ends.
    fn command_span(&self) -> Option<(&str, usize)> {
        if !self.is_command() {
            return None;
        }
        let text = self.text.as_deref()?;
        let entity = self.entities.first()?;
        Some((text, utf16_to_byte_index(text, entity.length)))
    }
}

/// Entity offsets are UTF-16 code units on the wire.
fn utf16_to_byte_index(text: &str, units: usize) -> usize {
    let mut seen = 0;
    for (idx, ch) in text.char_indices() {
        if seen >= units {
            return idx;
        }
        seen += ch.len_utf16();
    }
    text.len()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    pub fn bot_command(offset: usize, length: usize) -> Self {
        Self {
            kind: "bot_command".to_string(),
            offset,
            length,
        }
    }

    pub fn is_bot_command(&self) -> bool {
        self.kind == "bot_command"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

// =============================================================================
// Outbound
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    Markdown,
    MarkdownV2,
    #[serde(rename = "HTML")]
    Html,
}

/// A `sendMessage` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub chat_id: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    #[serde(default)]
    pub disable_web_page_preview: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
}

impl SendMessage {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            parse_mode: None,
            disable_web_page_preview: false,
            reply_to_message_id: None,
        }
    }

    pub fn parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = Some(mode);
        self
    }

    pub fn enable_web_page_preview(mut self) -> Self {
        self.disable_web_page_preview = false;
        self
    }

    /// Redirect the message to another chat.
    pub fn chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }
}

/// An entry of the command menu shown by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}
