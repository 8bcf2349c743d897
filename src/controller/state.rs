use crate::render::{Renderer, StatusIndicator};
use crate::tool_calls::ToolCallTracker;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Where the controller is in a turn's lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Request sent, backend has not confirmed the stream yet.
    Connecting,
    Streaming,
    /// Streaming with at least one tool invocation open.
    ToolRunning,
    /// A terminal event is being finalized.
    Finishing,
    /// The user stopped the turn; late events are dropped.
    Cancelling,
}

impl TurnPhase {
    /// Phases a user cancellation can interrupt.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::ToolRunning)
    }
}

/// Mutable state of one controller, guarded by a single mutex.
#[derive(Debug, Default)]
pub(super) struct ControllerState {
    pub(super) phase: TurnPhase,
    pub(super) processing: bool,
    pub(super) cancelling: bool,
    pub(super) token: Option<CancellationToken>,
    /// Bumped for every accepted turn so a stale guard never resets a newer
    /// turn.
    pub(super) generation: u64,
    pub(super) stream_started: bool,
    pub(super) visible: bool,
    pub(super) status: Option<StatusIndicator>,
    pub(super) text: String,
    pub(super) tools: ToolCallTracker,
}

impl ControllerState {
    /// Claim the turn slot. Returns the new generation.
    pub(super) fn reserve(&mut self) -> u64 {
        self.generation += 1;
        self.processing = true;
        self.cancelling = false;
        self.generation
    }

    /// Move a reserved slot into `Connecting`.
    pub(super) fn begin(&mut self, token: CancellationToken, prefill: Option<&str>) {
        self.phase = TurnPhase::Connecting;
        self.token = Some(token);
        self.stream_started = false;
        self.visible = false;
        self.status = Some(StatusIndicator::Connecting);
        self.text = prefill.unwrap_or_default().to_string();
        self.tools = ToolCallTracker::new();
    }
}

/// A claimed turn slot.
///
/// While a slot is held the controller reports itself as processing and
/// refuses every other turn, so multi-step operations can do their
/// preparatory deletes without another turn starting in between. Hand the
/// slot to [`TurnController::run_reserved`](super::TurnController::run_reserved)
/// to start the turn; dropping it releases the slot.
#[must_use = "dropping a slot releases it immediately"]
pub struct TurnSlot<'a> {
    pub(super) state: &'a Mutex<ControllerState>,
    pub(super) generation: u64,
    pub(super) armed: bool,
}

impl TurnSlot<'_> {
    /// Hand the slot over to a running turn without releasing it.
    pub(super) fn disarm(mut self) -> u64 {
        self.armed = false;
        self.generation
    }
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation == self.generation && state.phase == TurnPhase::Idle {
            log::debug!("Releasing unused turn slot generation={}", self.generation);
            state.processing = false;
        }
    }
}

/// Terminal cleanup that runs on every exit path of a turn, including when
/// the turn's future is dropped.
pub(super) struct ProcessingGuard<'a, R: Renderer> {
    pub(super) state: &'a Mutex<ControllerState>,
    pub(super) renderer: &'a R,
    pub(super) generation: u64,
}

impl<R: Renderer> Drop for ProcessingGuard<'_, R> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation != self.generation {
            return;
        }

        if state.phase.is_cancellable() {
            // Dropped mid-stream: nothing will finalize the open reply.
            log::warn!(
                "Turn abandoned before a terminal event phase={:?} generation={}",
                state.phase,
                self.generation
            );
            if self.renderer.has_visible_content() {
                self.renderer.cancel_streaming();
            } else {
                self.renderer.discard_streaming();
            }
        }
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        state.processing = false;
        state.cancelling = false;
        state.phase = TurnPhase::Idle;
        state.status = None;
        self.renderer.hide_status();
        self.renderer.focus_input();
    }
}
