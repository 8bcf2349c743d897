//! Core types for the chat turn SDK.
//!
//! This module contains the data model shared by every component:
//!
//! - [`ChatId`]: Identity of one conversation
//! - [`MessageTimestamp`]: Server-assigned, stable identity of a message
//! - [`Message`]: One chat entry, possibly split into typed parts
//! - [`TurnRequest`]: Inputs for one send / regenerate / continue cycle
//! - [`ClientConfig`]: Timing and per-chat settings read by the controller
//! - [`TurnError`]: Error surfaced by the controller and the operation façade

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identity of one conversation on the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, server-assigned message identity.
///
/// Unique within a chat and stable across edits, so it is used for every
/// edit/delete/continue operation instead of the rendering-time index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTimestamp(pub String);

const PENDING_PREFIX: &str = "pending-";

impl MessageTimestamp {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Placeholder identity for an optimistic local echo that the server has
    /// not assigned yet.
    #[must_use]
    pub fn pending() -> Self {
        Self(format!("{PENDING_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_PREFIX)
    }
}

impl std::fmt::Display for MessageTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One typed segment of a message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Prose of the message with tool segments left out.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ToolCall { .. } | ContentPart::ToolResult { .. } => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub timestamp: MessageTimestamp,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>, timestamp: MessageTimestamp) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
            timestamp,
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>, timestamp: MessageTimestamp) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            timestamp,
        }
    }

    #[must_use]
    pub fn tool(parts: Vec<ContentPart>, timestamp: MessageTimestamp) -> Self {
        Self {
            role: Role::Tool,
            content: Content::Parts(parts),
            timestamp,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Same role and prose, ignoring identity. Used to match optimistic
    /// echoes against the server's copy.
    #[must_use]
    pub fn same_text(&self, other: &Self) -> bool {
        self.role == other.role && self.text() == other.text()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Send,
    Regenerate,
    Continue,
}

impl std::fmt::Display for TurnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Send => "send",
            Self::Regenerate => "regenerate",
            Self::Continue => "continue",
        };
        f.write_str(name)
    }
}

/// Inputs for one request/response cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub kind: TurnKind,
    /// User text anchoring the turn.
    pub seed_text: String,
    /// Existing assistant text to extend (continue only).
    pub prefill: Option<String>,
    /// Ask the server not to store the seed as a new user message.
    pub skip_user_message_echo: bool,
}

impl TurnRequest {
    #[must_use]
    pub fn send(seed_text: impl Into<String>) -> Self {
        Self {
            kind: TurnKind::Send,
            seed_text: seed_text.into(),
            prefill: None,
            skip_user_message_echo: false,
        }
    }

    #[must_use]
    pub fn regenerate(seed_text: impl Into<String>) -> Self {
        Self {
            kind: TurnKind::Regenerate,
            seed_text: seed_text.into(),
            prefill: None,
            skip_user_message_echo: false,
        }
    }

    #[must_use]
    pub fn continue_from(seed_text: impl Into<String>, prefill: impl Into<String>) -> Self {
        Self {
            kind: TurnKind::Continue,
            seed_text: seed_text.into(),
            prefill: Some(prefill.into()),
            skip_user_message_echo: true,
        }
    }
}

/// Per-chat configuration. Read by the controller, never mutated by it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatSettings {
    pub persona: Option<String>,
    pub voice: Option<String>,
    pub model: Option<String>,
    /// Read finished replies aloud.
    pub speak_responses: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            persona: None,
            voice: None,
            model: None,
            speak_responses: true,
        }
    }
}

/// Configuration for one conversation's controller and reconciler.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub chat_id: ChatId,
    /// Restart-on-trigger window that coalesces reconciliation requests.
    pub reconcile_debounce: Duration,
    /// Pause between finalizing a reply and starting playback, so the
    /// rendering layer has settled.
    pub audio_settle_delay: Duration,
    pub settings: ChatSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chat_id: ChatId::new(),
            reconcile_debounce: Duration::from_millis(250),
            audio_settle_delay: Duration::from_millis(150),
            settings: ChatSettings::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }

    /// Short timings (for testing)
    #[must_use]
    pub fn fast(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            reconcile_debounce: Duration::from_millis(10),
            audio_settle_delay: Duration::from_millis(5),
            settings: ChatSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnErrorKind {
    /// Transport failed before the backend confirmed the stream.
    Connection,
    /// Transport failed after the stream started.
    Transport,
    /// The backend reported a terminal `error` event.
    Server,
    /// The user cancelled the operation.
    Cancelled,
    /// The request was rejected locally before any network call.
    Validation,
    /// A history lookup or delete failed.
    Backend,
    /// A reconciliation fetch failed.
    Reconcile,
}

/// Error from the turn controller or the operation façade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
    /// HTTP-style status code, when the backend supplied one.
    pub status: Option<u16>,
}

impl TurnError {
    /// Reason carried by a transport that was aborted on purpose.
    pub const CANCELLED_REASON: &'static str = "operation was cancelled";

    #[must_use]
    pub fn new(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(TurnErrorKind::Cancelled, Self::CANCELLED_REASON)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TurnErrorKind::Validation, message)
    }

    /// User cancellation is never surfaced as an error.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.kind == TurnErrorKind::Cancelled || self.message == Self::CANCELLED_REASON
    }
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TurnError {}
