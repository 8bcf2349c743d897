//! Turn controller.
//!
//! [`TurnController`] drives one turn at a time from request to terminal
//! event:
//!
//! ```text
//! Idle -> Connecting -> Streaming (<-> ToolRunning) -> Finishing -> Idle
//!             \              /
//!              -> Cancelling
//! ```
//!
//! All mutable state (processing flag, cancelling flag, cancellation token,
//! phase, tool records) lives behind one mutex, and renderer updates for a
//! stream event happen while that mutex is held. A user cancellation takes
//! the same mutex, so it is ordered either entirely before or entirely after
//! any event: once [`TurnController::cancel`] returns `true`, no further
//! event reaches the renderer, and a `done` that had not been applied yet
//! can no longer finalize the turn as a success.

mod state;

#[cfg(test)]
pub(crate) mod test_utils;

pub use state::{TurnPhase, TurnSlot};

use state::{ControllerState, ProcessingGuard};

use crate::events::StreamEvent;
use crate::reconciler::HistoryReconciler;
use crate::render::{AudioPlayer, Notice, Renderer, StatusIndicator};
use crate::stores::HistoryStore;
use crate::tool_calls::ToolInvocation;
use crate::transport::{StreamReader, StreamRequest, TurnTransport};
use crate::types::{ClientConfig, TurnError, TurnErrorKind, TurnKind, TurnRequest};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How a turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Another turn was in flight; nothing happened.
    Rejected,
    /// The backend finished the turn.
    Completed { ephemeral: bool },
    /// The user stopped the turn.
    Cancelled,
    Failed(TurnError),
}

/// Result of [`TurnController::run_turn`].
#[derive(Clone, Debug)]
pub struct TurnSummary {
    pub kind: TurnKind,
    pub outcome: TurnOutcome,
    /// Reply text as rendered at the end of the turn, including any prefill.
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub stream_started: bool,
    /// A tool invocation was left open at the terminal event, or the turn
    /// failed.
    pub abnormal: bool,
    pub duration: Duration,
}

impl TurnSummary {
    #[must_use]
    pub const fn rejected(kind: TurnKind) -> Self {
        Self {
            kind,
            outcome: TurnOutcome::Rejected,
            text: String::new(),
            tool_calls: Vec::new(),
            stream_started: false,
            abnormal: false,
            duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Rejected)
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Completed { .. })
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Cancelled)
    }

    /// Only a persisted reply from a stream that actually started is spoken.
    fn should_speak(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Completed { ephemeral: false })
            && self.stream_started
            && !self.text.trim().is_empty()
    }
}

/// Why the event loop stopped.
enum Terminal {
    Done { ephemeral: bool },
    Failed(TurnError),
    Cancelled,
}

pub struct TurnController<T, H, R, A> {
    transport: Arc<T>,
    reconciler: Arc<HistoryReconciler<H, R>>,
    renderer: Arc<R>,
    audio: Arc<A>,
    config: ClientConfig,
    state: Mutex<ControllerState>,
}

impl<T, H, R, A> TurnController<T, H, R, A>
where
    T: TurnTransport + 'static,
    H: HistoryStore + 'static,
    R: Renderer + 'static,
    A: AudioPlayer + 'static,
{
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        reconciler: Arc<HistoryReconciler<H, R>>,
        renderer: Arc<R>,
        audio: Arc<A>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            reconciler,
            renderer,
            audio,
            config,
            state: Mutex::new(ControllerState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.lock_state().phase
    }

    /// Whether a turn is in flight. New turns are rejected while it is set.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.lock_state().processing
    }

    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.lock_state().cancelling
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn reconciler(&self) -> &Arc<HistoryReconciler<H, R>> {
        &self.reconciler
    }

    /// Run one turn to its terminal event.
    ///
    /// Returns immediately with [`TurnOutcome::Rejected`] if another turn
    /// is in flight. Errors are shown to the user through the renderer and
    /// reported in the summary, never returned.
    pub async fn run_turn(&self, request: TurnRequest) -> TurnSummary {
        let Some(slot) = self.reserve() else {
            debug!("Rejecting {} turn: another turn is in flight", request.kind);
            return TurnSummary::rejected(request.kind);
        };
        self.run_reserved(slot, request).await
    }

    /// Claim the turn slot without starting a turn yet.
    ///
    /// Returns `None` if a turn is in flight or another slot is held. While
    /// the returned slot lives, [`run_turn`](Self::run_turn) and further
    /// reservations are refused.
    pub fn reserve(&self) -> Option<TurnSlot<'_>> {
        let mut state = self.lock_state();
        if state.processing {
            return None;
        }
        let generation = state.reserve();
        debug!("Reserved turn slot generation={generation}");
        Some(TurnSlot {
            state: &self.state,
            generation,
            armed: true,
        })
    }

    /// Run one turn in a slot obtained from [`reserve`](Self::reserve).
    ///
    /// A slot from a different controller is refused.
    pub async fn run_reserved(&self, slot: TurnSlot<'_>, request: TurnRequest) -> TurnSummary {
        let started_at = Instant::now();
        let Some((guard, token)) = self.begin(slot, &request) else {
            warn!("Rejecting {} turn: slot does not belong to this controller", request.kind);
            return TurnSummary::rejected(request.kind);
        };

        let terminal = self.drive(&request, token).await;
        let mut summary = self.finalize(request.kind, terminal);
        summary.duration = started_at.elapsed();
        drop(guard);

        info!(
            "Turn finished kind={} outcome={:?} stream_started={} tool_calls={} abnormal={} duration_ms={}",
            summary.kind,
            summary.outcome,
            summary.stream_started,
            summary.tool_calls.len(),
            summary.abnormal,
            summary.duration.as_millis()
        );

        if self.config.settings.speak_responses && summary.should_speak() {
            sleep(self.config.audio_settle_delay).await;
            if let Err(error) = self.audio.play_text(&summary.text).await {
                warn!("Audio playback failed error={error}");
            }
        }
        summary
    }

    /// Stop the in-flight turn.
    ///
    /// Returns `true` if a connecting or streaming turn moved to
    /// `Cancelling`. The partial reply is marked cancelled (or removed if it
    /// shows nothing yet), the token is revoked, and the backend is told in a
    /// detached task whose failure is only logged.
    pub fn cancel(&self) -> bool {
        let token = {
            let mut state = self.lock_state();
            if !state.processing || state.cancelling || !state.phase.is_cancellable() {
                debug!(
                    "Ignoring cancel processing={} phase={:?}",
                    state.processing, state.phase
                );
                return false;
            }
            state.cancelling = true;
            state.phase = TurnPhase::Cancelling;
            if self.renderer.has_visible_content() {
                self.renderer.cancel_streaming();
            } else {
                self.renderer.discard_streaming();
            }
            if state.status.take().is_some() {
                self.renderer.hide_status();
            }
            state.token.clone()
        };

        if let Some(token) = token {
            token.cancel();
        }
        info!("Turn cancellation requested chat_id={}", self.config.chat_id);
        self.notify_cancel_detached();
        true
    }

    fn notify_cancel_detached(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, skipping cancel notification");
            return;
        };
        let transport = Arc::clone(&self.transport);
        let chat_id = self.config.chat_id.clone();
        runtime.spawn(async move {
            if let Err(error) = transport.notify_cancel(&chat_id).await {
                warn!("Cancel notification failed chat_id={chat_id} error={error}");
            }
        });
    }

    fn begin(
        &self,
        slot: TurnSlot<'_>,
        request: &TurnRequest,
    ) -> Option<(ProcessingGuard<'_, R>, CancellationToken)> {
        if !std::ptr::eq(slot.state, &self.state) {
            return None;
        }
        let mut state = self.lock_state();
        let generation = slot.disarm();
        if state.generation != generation || !state.processing {
            return None;
        }
        let token = CancellationToken::new();
        state.begin(token.clone(), request.prefill.as_deref());
        self.renderer.start_streaming(request.prefill.as_deref());
        self.renderer.set_status(StatusIndicator::Connecting);
        info!(
            "Starting turn kind={} chat_id={} generation={generation}",
            request.kind, self.config.chat_id
        );

        let guard = ProcessingGuard {
            state: &self.state,
            renderer: self.renderer.as_ref(),
            generation,
        };
        Some((guard, token))
    }

    async fn drive(&self, request: &TurnRequest, token: CancellationToken) -> Terminal {
        let stream_request =
            StreamRequest::new(self.config.chat_id.clone(), request, &self.config.settings);
        let stream = match self.transport.open_stream(&stream_request, token.clone()).await {
            Ok(stream) => stream,
            Err(error) => {
                if token.is_cancelled() {
                    return Terminal::Cancelled;
                }
                warn!("Failed to open turn stream error={error}");
                return Terminal::Failed(TurnError::new(
                    TurnErrorKind::Connection,
                    format!("Failed to connect: {error}"),
                ));
            }
        };

        let mut reader = StreamReader::new(stream, token);
        while let Some(item) = reader.next().await {
            let mut state = self.lock_state();
            if state.cancelling {
                debug!("Dropping late stream item after cancellation");
                return Terminal::Cancelled;
            }
            let event = match item {
                Ok(event) => event,
                Err(error) => return Terminal::Failed(error),
            };
            if let Some(terminal) = self.apply_event(&mut state, event) {
                return terminal;
            }
        }

        if self.lock_state().cancelling {
            return Terminal::Cancelled;
        }
        let kind = if reader.started() {
            TurnErrorKind::Transport
        } else {
            TurnErrorKind::Connection
        };
        warn!("Turn stream ended without a terminal event");
        Terminal::Failed(TurnError::new(
            kind,
            "Stream ended unexpectedly without completion",
        ))
    }

    /// Apply one non-late event. Called with the state lock held.
    fn apply_event(&self, state: &mut ControllerState, event: StreamEvent) -> Option<Terminal> {
        let visible = event.is_visible_content();
        match event {
            StreamEvent::StreamStarted => {
                debug!("Stream started generation={}", state.generation);
                state.stream_started = true;
                if state.phase == TurnPhase::Connecting {
                    state.phase = TurnPhase::Streaming;
                }
                if !state.visible {
                    self.show_status(state, StatusIndicator::Generating);
                }
            }
            StreamEvent::Delta { text } => {
                if state.phase == TurnPhase::Connecting {
                    state.phase = TurnPhase::Streaming;
                }
                state.stream_started = true;
                if !text.is_empty() {
                    self.renderer.append_stream(&text);
                    state.text.push_str(&text);
                }
                if visible {
                    self.mark_content(state);
                }
            }
            StreamEvent::ToolStart { id, name, args } => {
                debug!("Tool started id={id} name={name}");
                if let Some(invocation) = state.tools.on_start(&id, &name, args) {
                    self.renderer.tool_updated(invocation);
                }
                state.phase = TurnPhase::ToolRunning;
                self.mark_content(state);
            }
            StreamEvent::ToolEnd { id, result, error } => {
                if let Some(invocation) = state.tools.on_end(&id, result, error) {
                    debug!("Tool finished id={id} open={}", invocation.is_open());
                    self.renderer.tool_updated(invocation);
                }
                if state.phase == TurnPhase::ToolRunning && state.tools.open_count() == 0 {
                    state.phase = TurnPhase::Streaming;
                }
            }
            StreamEvent::IterationStart { iteration } => {
                debug!("Iteration started iteration={iteration}");
                if iteration > 1 {
                    self.show_status(state, StatusIndicator::Generating);
                }
            }
            StreamEvent::Done { ephemeral } => return Some(Terminal::Done { ephemeral }),
            StreamEvent::Error { message, status } => {
                let mut error = TurnError::new(TurnErrorKind::Server, message);
                error.status = status;
                return Some(Terminal::Failed(error));
            }
        }
        None
    }

    fn show_status(&self, state: &mut ControllerState, status: StatusIndicator) {
        self.renderer.set_status(status);
        state.status = Some(status);
    }

    /// First visible content hides any lingering status indicator.
    fn mark_content(&self, state: &mut ControllerState) {
        state.visible = true;
        if state.status.take().is_some() {
            self.renderer.hide_status();
        }
    }

    fn finalize(&self, kind: TurnKind, terminal: Terminal) -> TurnSummary {
        let mut state = self.lock_state();

        // A cancellation that got in first owns the render; `done` is ignored.
        let outcome = if state.cancelling {
            if let Terminal::Done { ephemeral } = terminal {
                debug!("Ignoring done(ephemeral={ephemeral}) for a cancelled turn");
            }
            TurnOutcome::Cancelled
        } else {
            state.phase = TurnPhase::Finishing;
            match terminal {
                Terminal::Done { ephemeral } => {
                    state.text = self.renderer.finish_streaming(ephemeral);
                    TurnOutcome::Completed { ephemeral }
                }
                Terminal::Cancelled => {
                    self.close_partial(None);
                    TurnOutcome::Cancelled
                }
                Terminal::Failed(error) if error.is_cancellation() => {
                    self.close_partial(None);
                    TurnOutcome::Cancelled
                }
                Terminal::Failed(error) => {
                    warn!("Turn failed kind={:?} error={error}", error.kind);
                    self.close_partial(Some(&error));
                    self.renderer.show_notice(Notice::error(error.to_string()));
                    TurnOutcome::Failed(error)
                }
            }
        };

        let unfinished = state.tools.unfinished();
        if !unfinished.is_empty() {
            warn!("Turn ended with open tool invocations ids={unfinished:?}");
        }
        let tools = std::mem::take(&mut state.tools);
        let summary = TurnSummary {
            kind,
            abnormal: !unfinished.is_empty() || matches!(outcome, TurnOutcome::Failed(_)),
            outcome,
            text: state.text.clone(),
            tool_calls: tools.into_invocations(),
            stream_started: state.stream_started,
            duration: Duration::ZERO,
        };
        drop(state);

        // Connection failures never reached the server's history.
        let connection_failure = matches!(
            &summary.outcome,
            TurnOutcome::Failed(error) if error.kind == TurnErrorKind::Connection
        );
        if !connection_failure {
            self.reconciler.trigger();
        }
        summary
    }

    /// Mark a partial reply cancelled or failed, or drop it when it shows
    /// nothing.
    fn close_partial(&self, error: Option<&TurnError>) {
        if !self.renderer.has_visible_content() {
            self.renderer.discard_streaming();
            return;
        }
        match error {
            Some(error) => self.renderer.fail_streaming(&error.message),
            None => self.renderer.cancel_streaming(),
        }
    }
}
