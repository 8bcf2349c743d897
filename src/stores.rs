//! History store contract.
//!
//! The server holds the authoritative message history. The client reads it
//! through [`HistoryStore`] in two shapes:
//!
//! - `history` - the rendered view: tool entries hidden, the assistant
//!   fragments of one turn merged into a single message
//! - `raw_history` - every stored entry, used only to rebuild a split reply
//!
//! # Built-in Implementation
//!
//! [`InMemoryHistory`] applies the same cascade rules in-process and is
//! suitable for testing and offline hosts.

use crate::types::{Content, Message, MessageTimestamp, Role};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a user message by timestamp, falling back to its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAnchor {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<MessageTimestamp>,
}

impl UserAnchor {
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            content: message.text(),
            timestamp: (!message.timestamp.is_pending()).then(|| message.timestamp.clone()),
        }
    }
}

/// Read and destructive-edit access to the server-side history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Ordered messages as the chat view shows them.
    ///
    /// # Errors
    /// Returns an error if the history cannot be retrieved.
    async fn history(&self) -> Result<Vec<Message>>;

    /// Every stored entry, unfiltered.
    ///
    /// # Errors
    /// Returns an error if the history cannot be retrieved.
    async fn raw_history(&self) -> Result<Vec<Message>>;

    /// Delete a user message and every entry after it.
    ///
    /// # Errors
    /// Returns an error if no user message matches or the delete fails.
    async fn delete_from_user(&self, anchor: &UserAnchor) -> Result<()>;

    /// Delete an assistant message and every entry after it, keeping the
    /// user message that prompted it.
    ///
    /// # Errors
    /// Returns an error if no message matches or the delete fails.
    async fn delete_from_assistant(&self, timestamp: &MessageTimestamp) -> Result<()>;

    /// Delete exactly one stored assistant entry.
    ///
    /// # Errors
    /// Returns an error if no message matches or the delete fails.
    async fn delete_assistant_message(&self, timestamp: &MessageTimestamp) -> Result<()>;
}

/// Collapse a raw log into the rendered view.
#[must_use]
pub fn filtered_view(raw: &[Message]) -> Vec<Message> {
    let mut view: Vec<Message> = Vec::with_capacity(raw.len());
    for message in raw {
        match message.role {
            Role::Tool => {}
            Role::User => view.push(message.clone()),
            Role::Assistant => match view.last_mut() {
                Some(last) if last.role == Role::Assistant => {
                    last.content = Content::Text(last.text() + &message.text());
                    last.timestamp = message.timestamp.clone();
                }
                _ => view.push(message.clone()),
            },
        }
    }
    view
}

/// In-memory implementation of `HistoryStore`.
#[derive(Default)]
pub struct InMemoryHistory {
    raw: RwLock<Vec<Message>>,
    clock: AtomicU64,
}

impl InMemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let count = messages.len() as u64;
        Self {
            raw: RwLock::new(messages),
            clock: AtomicU64::new(count),
        }
    }

    /// Next server-style timestamp.
    #[must_use]
    pub fn next_timestamp(&self) -> MessageTimestamp {
        MessageTimestamp(format!("ts-{}", self.clock.fetch_add(1, Ordering::Relaxed) + 1))
    }

    /// Store a message as the server would after a turn.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn append(&self, role: Role, text: impl Into<String>) -> Result<MessageTimestamp> {
        let timestamp = self.next_timestamp();
        let message = Message {
            role,
            content: Content::Text(text.into()),
            timestamp: timestamp.clone(),
        };
        self.raw.write().ok().context("lock poisoned")?.push(message);
        Ok(timestamp)
    }

    fn truncate_at(&self, position: impl Fn(&[Message]) -> Option<usize>) -> Result<()> {
        let mut raw = self.raw.write().ok().context("lock poisoned")?;
        let Some(index) = position(raw.as_slice()) else {
            bail!("message not found");
        };
        raw.truncate(index);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn history(&self) -> Result<Vec<Message>> {
        let raw = self.raw.read().ok().context("lock poisoned")?;
        Ok(filtered_view(&raw))
    }

    async fn raw_history(&self) -> Result<Vec<Message>> {
        let raw = self.raw.read().ok().context("lock poisoned")?;
        Ok(raw.clone())
    }

    async fn delete_from_user(&self, anchor: &UserAnchor) -> Result<()> {
        self.truncate_at(|raw| {
            let by_timestamp = anchor.timestamp.as_ref().and_then(|ts| {
                raw.iter()
                    .position(|m| m.role == Role::User && &m.timestamp == ts)
            });
            by_timestamp.or_else(|| {
                raw.iter()
                    .rposition(|m| m.role == Role::User && m.text() == anchor.content)
            })
        })
    }

    async fn delete_from_assistant(&self, timestamp: &MessageTimestamp) -> Result<()> {
        // The rendered message carries the timestamp of its last fragment;
        // the cut starts at the first fragment of that turn.
        self.truncate_at(|raw| {
            let last = raw
                .iter()
                .position(|m| m.role == Role::Assistant && &m.timestamp == timestamp)?;
            let first = raw[..last]
                .iter()
                .rposition(|m| m.role == Role::User)
                .map_or(0, |user| user + 1);
            Some(first)
        })
    }

    async fn delete_assistant_message(&self, timestamp: &MessageTimestamp) -> Result<()> {
        let mut raw = self.raw.write().ok().context("lock poisoned")?;
        let Some(index) = raw
            .iter()
            .position(|m| m.role == Role::Assistant && &m.timestamp == timestamp)
        else {
            bail!("assistant message {timestamp} not found");
        };
        raw.remove(index);
        Ok(())
    }
}
