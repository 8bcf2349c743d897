//! Rendering and audio collaborators.
//!
//! The controller never formats anything itself. It hands raw deltas and
//! lifecycle signals to a [`Renderer`] and finished replies to an
//! [`AudioPlayer`].
//!
//! # Built-in Implementations
//!
//! - [`BufferRenderer`] - Headless renderer that keeps bubbles in memory
//! - [`SilentAudio`] - Audio player that discards everything

use crate::tool_calls::ToolInvocation;
use crate::types::{Message, MessageTimestamp, Role};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transient indicator shown while a reply has no visible content yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusIndicator {
    Connecting,
    Generating,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Dismissible message for the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Presentation layer for one conversation.
///
/// Calls are synchronous and cheap; the controller may hold its own state
/// lock while calling them.
pub trait Renderer: Send + Sync {
    /// Show a user message.
    fn add_user_message(&self, message: &Message);

    /// Open the reply bubble, optionally seeded with text being continued.
    fn start_streaming(&self, prefill: Option<&str>);

    /// Append a raw delta to the open reply.
    fn append_stream(&self, delta: &str);

    fn set_status(&self, status: StatusIndicator);

    fn hide_status(&self);

    /// A tool invocation opened or closed.
    fn tool_updated(&self, _invocation: &ToolInvocation) {
        // Default: tools are not displayed
    }

    /// Close the reply and return its final text. Ephemeral replies are
    /// dropped from the persisted view.
    fn finish_streaming(&self, ephemeral: bool) -> String;

    /// Keep the partial reply, marked as cancelled.
    fn cancel_streaming(&self);

    /// Keep the partial reply, marked as failed.
    fn fail_streaming(&self, _message: &str) {
        self.cancel_streaming();
    }

    /// Remove the open reply without a trace.
    fn discard_streaming(&self);

    /// Whether the open reply shows anything besides whitespace.
    fn has_visible_content(&self) -> bool;

    /// Re-render the whole conversation.
    fn replace_history(&self, messages: &[Message]);

    fn show_notice(&self, notice: Notice);

    /// Ask the user a yes/no question.
    fn confirm(&self, prompt: &str) -> bool;

    fn focus_input(&self) {
        // Default: no input control
    }
}

/// Text-to-speech playback.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Speak a finished reply.
    ///
    /// # Errors
    /// Returns an error if playback cannot start.
    async fn play_text(&self, text: &str) -> Result<()>;
}

/// Audio player that plays nothing.
pub struct SilentAudio;

#[async_trait]
impl AudioPlayer for SilentAudio {
    async fn play_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BubbleState {
    Streaming,
    Final,
    Ephemeral,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderedMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: Option<MessageTimestamp>,
    pub state: BubbleState,
    pub tools: Vec<ToolInvocation>,
}

#[derive(Debug)]
struct BufferState {
    messages: Vec<RenderedMessage>,
    streaming: Option<usize>,
    status: Option<StatusIndicator>,
    notices: Vec<Notice>,
    prompts: Vec<String>,
    confirm_answer: bool,
    replace_count: usize,
    focus_count: usize,
}

/// In-memory renderer.
///
/// Keeps the bubbles, indicator and notices a real UI would show. Useful
/// for tests and terminal hosts.
pub struct BufferRenderer {
    state: Mutex<BufferState>,
}

impl Default for BufferRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                messages: Vec::new(),
                streaming: None,
                status: None,
                notices: Vec::new(),
                prompts: Vec::new(),
                confirm_answer: true,
                replace_count: 0,
                focus_count: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer future confirmation prompts with `answer`.
    pub fn set_confirm_answer(&self, answer: bool) {
        self.state().confirm_answer = answer;
    }

    #[must_use]
    pub fn messages(&self) -> Vec<RenderedMessage> {
        self.state().messages.clone()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<RenderedMessage> {
        self.state().messages.last().cloned()
    }

    #[must_use]
    pub fn status(&self) -> Option<StatusIndicator> {
        self.state().status
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.state().notices.clone()
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.state().prompts.clone()
    }

    /// Number of full re-renders.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.state().replace_count
    }

    #[must_use]
    pub fn focus_count(&self) -> usize {
        self.state().focus_count
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state().streaming.is_some()
    }

    fn close_streaming(&self, state: BubbleState) -> Option<String> {
        let mut guard = self.state();
        let index = guard.streaming.take()?;
        let bubble = &mut guard.messages[index];
        bubble.state = state;
        Some(bubble.text.clone())
    }
}

impl Renderer for BufferRenderer {
    fn add_user_message(&self, message: &Message) {
        self.state().messages.push(RenderedMessage {
            role: Role::User,
            text: message.text(),
            timestamp: Some(message.timestamp.clone()),
            state: BubbleState::Final,
            tools: Vec::new(),
        });
    }

    fn start_streaming(&self, prefill: Option<&str>) {
        let mut state = self.state();
        state.messages.push(RenderedMessage {
            role: Role::Assistant,
            text: prefill.unwrap_or_default().to_string(),
            timestamp: None,
            state: BubbleState::Streaming,
            tools: Vec::new(),
        });
        state.streaming = Some(state.messages.len() - 1);
    }

    fn append_stream(&self, delta: &str) {
        let mut state = self.state();
        if let Some(index) = state.streaming {
            state.messages[index].text.push_str(delta);
        }
    }

    fn set_status(&self, status: StatusIndicator) {
        self.state().status = Some(status);
    }

    fn hide_status(&self) {
        self.state().status = None;
    }

    fn tool_updated(&self, invocation: &ToolInvocation) {
        let mut state = self.state();
        let Some(index) = state.streaming else {
            return;
        };
        let tools = &mut state.messages[index].tools;
        match tools.iter_mut().find(|t| t.id == invocation.id) {
            Some(existing) => *existing = invocation.clone(),
            None => tools.push(invocation.clone()),
        }
    }

    fn finish_streaming(&self, ephemeral: bool) -> String {
        let state = if ephemeral {
            BubbleState::Ephemeral
        } else {
            BubbleState::Final
        };
        self.close_streaming(state).unwrap_or_default()
    }

    fn cancel_streaming(&self) {
        self.close_streaming(BubbleState::Cancelled);
    }

    fn fail_streaming(&self, _message: &str) {
        self.close_streaming(BubbleState::Failed);
    }

    fn discard_streaming(&self) {
        let mut state = self.state();
        if let Some(index) = state.streaming.take() {
            state.messages.remove(index);
        }
    }

    fn has_visible_content(&self) -> bool {
        let state = self.state();
        state.streaming.is_some_and(|index| {
            let bubble = &state.messages[index];
            !bubble.text.trim().is_empty() || !bubble.tools.is_empty()
        })
    }

    fn replace_history(&self, messages: &[Message]) {
        let mut state = self.state();
        // An open reply stays at the end; it is not part of history yet.
        let open = state.streaming.take().map(|index| state.messages.remove(index));
        state.messages = messages
            .iter()
            .map(|m| RenderedMessage {
                role: m.role,
                text: m.text(),
                timestamp: Some(m.timestamp.clone()),
                state: BubbleState::Final,
                tools: Vec::new(),
            })
            .collect();
        if let Some(open) = open {
            state.messages.push(open);
            state.streaming = Some(state.messages.len() - 1);
        }
        state.replace_count += 1;
    }

    fn show_notice(&self, notice: Notice) {
        self.state().notices.push(notice);
    }

    fn confirm(&self, prompt: &str) -> bool {
        let mut state = self.state();
        state.prompts.push(prompt.to_string());
        state.confirm_answer
    }

    fn focus_input(&self) {
        self.state().focus_count += 1;
    }
}
