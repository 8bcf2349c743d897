//! Protocol events for one streamed turn.
//!
//! The [`StreamEvent`] enum is the typed form of every line the backend
//! sends while a turn is in flight. The controller consumes them with a
//! single exhaustive `match`.
//!
//! # Event Flow
//!
//! A typical event sequence looks like:
//! 1. `StreamStarted` - The backend accepted the request
//! 2. `Delta` / `ToolStart` / `ToolEnd` / `IterationStart` - Content events
//! 3. `Done` - Terminal success, or `Error` if the turn failed

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First confirmation that the backend accepted the request
    StreamStarted,

    /// A text fragment to append to the reply
    Delta { text: String },

    /// A tool invocation was announced
    ToolStart {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },

    /// A tool invocation finished, with a result or an error
    ToolEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The model continues after tool results; iterations count from 1
    IterationStart { iteration: u32 },

    /// Terminal success
    Done {
        /// Output must not be persisted, counted or spoken.
        #[serde(default)]
        ephemeral: bool,
    },

    /// Terminal failure
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl StreamEvent {
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    #[must_use]
    pub fn tool_start(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::ToolStart {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn tool_result(id: impl Into<String>, result: impl Into<serde_json::Value>) -> Self {
        Self::ToolEnd {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn tool_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ToolEnd {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub const fn iteration_start(iteration: u32) -> Self {
        Self::IterationStart { iteration }
    }

    #[must_use]
    pub const fn done(ephemeral: bool) -> Self {
        Self::Done { ephemeral }
    }

    #[must_use]
    pub fn error(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Error {
            message: message.into(),
            status,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Whether this event puts something the user can see into the reply.
    ///
    /// Whitespace-only deltas do not count; a tool announcement does.
    #[must_use]
    pub fn is_visible_content(&self) -> bool {
        match self {
            Self::Delta { text } => text.chars().any(|c| !c.is_whitespace()),
            Self::ToolStart { .. } => true,
            Self::StreamStarted
            | Self::ToolEnd { .. }
            | Self::IterationStart { .. }
            | Self::Done { .. }
            | Self::Error { .. } => false,
        }
    }

    /// Short name used in log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StreamStarted => "stream_started",
            Self::Delta { .. } => "delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::IterationStart { .. } => "iteration_start",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}
