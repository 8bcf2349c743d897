//! User-facing chat operations.
//!
//! [`ChatSession`] turns a user action into the inputs a turn needs
//! (which messages to delete, which text to seed, what prefill to resume
//! from) and hands the turn itself to the [`TurnController`]. Every
//! operation claims the controller's turn slot before its first await, so
//! it is refused while another turn is in flight and nothing else can start
//! while its deletes are outstanding.

use crate::controller::{TurnController, TurnSummary};
use crate::reconciler::{HistoryReconciler, ReconcileOutcome};
use crate::render::{AudioPlayer, Notice, Renderer};
use crate::stores::{HistoryStore, UserAnchor};
use crate::transport::TurnTransport;
use crate::types::{
    ClientConfig, Message, MessageTimestamp, Role, TurnError, TurnErrorKind, TurnKind,
    TurnRequest,
};
use log::{debug, info, warn};
use std::sync::Arc;

/// Result of [`ChatSession::delete_from`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A turn was in flight.
    Rejected,
    /// The user declined the confirmation.
    Declined,
    Deleted { count: usize },
}

/// A stored reply rebuilt from its raw fragments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconstructedTurn {
    /// All assistant fragments of the turn, concatenated in order.
    pub prefill: String,
    /// Timestamp of the last fragment, the one that gets deleted.
    pub last_timestamp: MessageTimestamp,
    pub fragments: usize,
}

/// Index of the user message that prompted the message at `index`: the
/// message itself if it is a user message, else the nearest one before it.
#[must_use]
pub fn governing_user(messages: &[Message], index: usize) -> Option<usize> {
    if index >= messages.len() {
        return None;
    }
    messages[..=index].iter().rposition(|m| m.role == Role::User)
}

/// Rebuild the reply that follows `user` in the raw log.
///
/// The user entry is located by timestamp when it has a real one, else by
/// the last user entry with the same text. The reply is every assistant
/// fragment up to the next user entry; tool entries in between are skipped.
#[must_use]
pub fn reconstruct_turn(raw: &[Message], user: &Message) -> Option<ReconstructedTurn> {
    let by_timestamp = if user.timestamp.is_pending() {
        None
    } else {
        raw.iter()
            .position(|m| m.role == Role::User && m.timestamp == user.timestamp)
    };
    let start = by_timestamp
        .or_else(|| raw.iter().rposition(|m| m.role == Role::User && m.same_text(user)))?;

    let mut prefill = String::new();
    let mut last_timestamp = None;
    let mut fragments = 0;
    for message in raw[start + 1..].iter().take_while(|m| m.role != Role::User) {
        if message.role == Role::Assistant {
            prefill.push_str(&message.text());
            last_timestamp = Some(message.timestamp.clone());
            fragments += 1;
        }
    }

    Some(ReconstructedTurn {
        prefill,
        last_timestamp: last_timestamp?,
        fragments,
    })
}

/// One conversation: send, regenerate, continue and delete on top of a
/// single backend.
pub struct ChatSession<B, R, A> {
    backend: Arc<B>,
    renderer: Arc<R>,
    controller: TurnController<B, B, R, A>,
}

impl<B, R, A> ChatSession<B, R, A>
where
    B: TurnTransport + HistoryStore + 'static,
    R: Renderer + 'static,
    A: AudioPlayer + 'static,
{
    #[must_use]
    pub fn new(backend: Arc<B>, renderer: Arc<R>, audio: Arc<A>, config: ClientConfig) -> Self {
        let reconciler = Arc::new(HistoryReconciler::new(
            Arc::clone(&backend),
            Arc::clone(&renderer),
            config.reconcile_debounce,
        ));
        let controller = TurnController::new(
            Arc::clone(&backend),
            reconciler,
            Arc::clone(&renderer),
            audio,
            config,
        );
        Self {
            backend,
            renderer,
            controller,
        }
    }

    #[must_use]
    pub const fn controller(&self) -> &TurnController<B, B, R, A> {
        &self.controller
    }

    #[must_use]
    pub const fn reconciler(&self) -> &Arc<HistoryReconciler<B, R>> {
        self.controller.reconciler()
    }

    /// Load or re-check the history immediately.
    ///
    /// # Errors
    /// Returns a reconcile error if the history cannot be fetched.
    pub async fn refresh(&self) -> Result<ReconcileOutcome, TurnError> {
        self.reconciler().reconcile_now().await
    }

    /// Something outside this session changed the history (another tab, a
    /// server push). Coalesced with other changes by the debounce window.
    pub fn history_changed(&self) {
        self.reconciler().trigger();
    }

    /// Stop the in-flight turn. See [`TurnController::cancel`].
    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    /// Send a new user message and stream the reply.
    ///
    /// Blank input is refused without a request.
    pub async fn send(&self, text: &str) -> TurnSummary {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring blank message");
            return TurnSummary::rejected(TurnKind::Send);
        }
        let Some(slot) = self.controller.reserve() else {
            return TurnSummary::rejected(TurnKind::Send);
        };

        let echo = Message::user(text, MessageTimestamp::pending());
        self.renderer.add_user_message(&echo);
        self.reconciler().apply_optimistic(|messages| messages.push(echo));
        self.controller
            .run_reserved(slot, TurnRequest::send(text))
            .await
    }

    /// Drop the reply to the user message governing `index` and generate a
    /// new one from the same text.
    ///
    /// # Errors
    /// Returns a validation error if no user message precedes `index`, or a
    /// backend error if the server-side delete fails. No turn starts in
    /// either case.
    pub async fn regenerate(&self, index: usize) -> Result<TurnSummary, TurnError> {
        let Some(slot) = self.controller.reserve() else {
            return Ok(TurnSummary::rejected(TurnKind::Regenerate));
        };
        let snapshot = self.reconciler().snapshot();
        let Some(user_index) = governing_user(snapshot.messages(), index) else {
            return Err(self.refuse(TurnError::validation(format!(
                "No user message to regenerate from at index {index}"
            ))));
        };
        let anchor = UserAnchor::from_message(&snapshot.messages()[user_index]);
        info!("Regenerating from user message index={user_index}");

        self.backend
            .delete_from_user(&anchor)
            .await
            .map_err(|e| self.backend_failure("Failed to delete messages", &e))?;

        let echo = Message::user(anchor.content.clone(), MessageTimestamp::pending());
        let view = self.reconciler().apply_optimistic(|messages| {
            messages.truncate(user_index);
            messages.push(echo);
            messages.clone()
        });
        self.renderer.replace_history(&view);

        Ok(self
            .controller
            .run_reserved(slot, TurnRequest::regenerate(anchor.content))
            .await)
    }

    /// Resume the assistant reply at `index` from where it stopped.
    ///
    /// The stored reply may be split into several fragments; all of them
    /// form the prefill, and only the last one is deleted so the backend can
    /// write the extended reply in its place.
    ///
    /// # Errors
    /// Returns a validation error if `index` is not an assistant message
    /// with a governing user message, or a backend error if the stored turn
    /// cannot be read or trimmed.
    pub async fn continue_at(&self, index: usize) -> Result<TurnSummary, TurnError> {
        let Some(slot) = self.controller.reserve() else {
            return Ok(TurnSummary::rejected(TurnKind::Continue));
        };
        let snapshot = self.reconciler().snapshot();
        if snapshot.get(index).is_none_or(|message| message.role != Role::Assistant) {
            return Err(self.refuse(TurnError::validation(
                "Only assistant messages can be continued",
            )));
        }
        let Some(user_index) = governing_user(snapshot.messages(), index) else {
            return Err(self.refuse(TurnError::validation(
                "No user message precedes this reply",
            )));
        };
        let user = snapshot.messages()[user_index].clone();

        let raw = self
            .backend
            .raw_history()
            .await
            .map_err(|e| self.backend_failure("Failed to load stored messages", &e))?;
        let Some(turn) = reconstruct_turn(&raw, &user) else {
            return Err(self.refuse(TurnError::new(
                TurnErrorKind::Backend,
                "Could not find the stored reply to continue",
            )));
        };
        info!(
            "Continuing reply index={index} fragments={} prefill_len={}",
            turn.fragments,
            turn.prefill.len()
        );

        self.backend
            .delete_assistant_message(&turn.last_timestamp)
            .await
            .map_err(|e| self.backend_failure("Failed to delete message", &e))?;

        // The bubble being continued is redrawn by the new turn.
        let view = self.reconciler().apply_optimistic(|messages| {
            if index < messages.len() {
                messages.remove(index);
            }
            messages.clone()
        });
        self.renderer.replace_history(&view);

        Ok(self
            .controller
            .run_reserved(slot, TurnRequest::continue_from(user.text(), turn.prefill))
            .await)
    }

    /// Delete the message at `index` and everything after it, after asking
    /// the user.
    ///
    /// # Errors
    /// Returns a validation error for an unknown index or a backend error
    /// if the delete fails.
    pub async fn delete_from(&self, index: usize) -> Result<DeleteOutcome, TurnError> {
        // Held until the local view reflects the delete.
        let Some(_slot) = self.controller.reserve() else {
            return Ok(DeleteOutcome::Rejected);
        };
        let snapshot = self.reconciler().snapshot();
        let Some(target) = snapshot.get(index).cloned() else {
            return Err(self.refuse(TurnError::validation(format!(
                "No message at index {index}"
            ))));
        };
        let count = snapshot.len() - index;
        if !self.renderer.confirm(&format!("Delete {count} message(s)?")) {
            debug!("Delete declined index={index}");
            return Ok(DeleteOutcome::Declined);
        }

        let result = match target.role {
            Role::User => {
                self.backend
                    .delete_from_user(&UserAnchor::from_message(&target))
                    .await
            }
            Role::Assistant | Role::Tool => {
                self.backend.delete_from_assistant(&target.timestamp).await
            }
        };
        result.map_err(|e| self.backend_failure("Failed to delete messages", &e))?;
        info!("Deleted messages index={index} count={count}");

        if let Err(error) = self.reconciler().reconcile_now().await {
            warn!("Refresh after delete failed, truncating locally error={error}");
            let view = self.reconciler().apply_optimistic(|messages| {
                messages.truncate(index);
                messages.clone()
            });
            self.renderer.replace_history(&view);
        }
        Ok(DeleteOutcome::Deleted { count })
    }

    fn refuse(&self, error: TurnError) -> TurnError {
        warn!("Operation refused kind={:?} error={error}", error.kind);
        self.renderer.show_notice(Notice::error(error.to_string()));
        error
    }

    fn backend_failure(&self, context: &str, error: &anyhow::Error) -> TurnError {
        self.refuse(TurnError::new(
            TurnErrorKind::Backend,
            format!("{context}: {error}"),
        ))
    }
}
