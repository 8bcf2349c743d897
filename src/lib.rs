//! Chat Turn SDK - streaming turn control for a chat assistant client.
//!
//! This crate provides the client-side core of a streaming chat UI:
//! - Cancellable SSE stream reading with ordered, terminal-aware delivery
//! - A turn state machine that serializes turns and resolves cancel races
//! - Tool-call lifecycle tracking inside a streamed reply
//! - Debounced reconciliation of the local history against the server
//! - Send, regenerate, continue and delete-cascade operations
//!
//! # Example
//!
//! ```ignore
//! use chat_turn_sdk::{
//!     BufferRenderer, ChatId, ChatSession, ClientConfig, HttpBackend, SilentAudio,
//! };
//! use std::sync::Arc;
//!
//! let chat_id = ChatId::from_string("chat-42");
//! let backend = Arc::new(HttpBackend::new("http://localhost:8000", chat_id.clone()));
//! let renderer = Arc::new(BufferRenderer::new());
//! let session = ChatSession::new(
//!     backend,
//!     Arc::clone(&renderer),
//!     Arc::new(SilentAudio),
//!     ClientConfig::new(chat_id),
//! );
//!
//! session.refresh().await?;
//! let summary = session.send("Hello").await;
//! println!("{:?}: {}", summary.outcome, summary.text);
//! ```

#![forbid(unsafe_code)]

pub mod controller;
mod events;
pub mod operations;
pub mod reconciler;
pub mod render;
mod stores;
mod tool_calls;
pub mod transport;
mod types;

pub use controller::{TurnController, TurnOutcome, TurnPhase, TurnSlot, TurnSummary};
pub use events::StreamEvent;
pub use operations::{ChatSession, DeleteOutcome};
pub use reconciler::{HistoryReconciler, HistorySnapshot, ReconcileOutcome};
pub use render::{
    AudioPlayer, BubbleState, BufferRenderer, Notice, NoticeLevel, RenderedMessage, Renderer,
    SilentAudio, StatusIndicator,
};
pub use stores::{HistoryStore, InMemoryHistory, UserAnchor, filtered_view};
pub use tool_calls::{ToolCallState, ToolCallTracker, ToolInvocation};
pub use transport::{
    EventStream, HttpBackend, SseDecoder, StreamReader, StreamRequest, TurnTransport,
};
pub use types::{
    ChatId, ChatSettings, ClientConfig, Content, ContentPart, Message, MessageTimestamp, Role,
    TurnError, TurnErrorKind, TurnKind, TurnRequest,
};
