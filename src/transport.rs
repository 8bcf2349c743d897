//! Transport stream reading.
//!
//! A [`TurnTransport`] opens one cancellable request per turn and hands back
//! an [`EventStream`] of decoded [`StreamEvent`]s. [`StreamReader`] wraps that
//! stream together with the turn's [`CancellationToken`] and guarantees that
//! nothing is yielded once the token is revoked or a terminal event has been
//! seen.

pub mod http;
pub mod sse;

pub use http::HttpBackend;
pub use sse::SseDecoder;

use crate::events::StreamEvent;
use crate::types::{ChatId, ChatSettings, TurnError, TurnErrorKind, TurnKind, TurnRequest};
use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Boxed stream of decoded protocol events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Outbound body of a stream request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub chat_id: ChatId,
    pub kind: TurnKind,
    pub seed_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<String>,
    #[serde(default)]
    pub skip_user_message_echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl StreamRequest {
    #[must_use]
    pub fn new(chat_id: ChatId, request: &TurnRequest, settings: &ChatSettings) -> Self {
        Self {
            chat_id,
            kind: request.kind,
            seed_text: request.seed_text.clone(),
            prefill: request.prefill.clone(),
            skip_user_message_echo: request.skip_user_message_echo,
            persona: settings.persona.clone(),
            model: settings.model.clone(),
            voice: settings.voice.clone(),
        }
    }
}

/// Outbound side of the chat backend.
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Open one stream for a turn. The token is the transport's abort
    /// signal; implementations should stop reading once it is cancelled.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent.
    async fn open_stream(
        &self,
        request: &StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream>;

    /// Tell the backend the user stopped the turn. Best-effort.
    ///
    /// # Errors
    /// Returns an error if the notification cannot be delivered.
    async fn notify_cancel(&self, chat_id: &ChatId) -> Result<()>;
}

/// Reads one turn's events in arrival order.
///
/// Not restartable: the reader owns its stream and stops for good after a
/// terminal event, a revoked token, or the end of the stream.
pub struct StreamReader {
    stream: EventStream,
    cancel: CancellationToken,
    started: bool,
    finished: bool,
    yielded: u64,
}

impl StreamReader {
    #[must_use]
    pub fn new(stream: EventStream, cancel: CancellationToken) -> Self {
        Self {
            stream,
            cancel,
            started: false,
            finished: false,
            yielded: 0,
        }
    }

    /// Next event, or `None` when the reader is finished.
    ///
    /// Transport failures are classified as [`TurnErrorKind::Connection`]
    /// before `stream_started` was seen and [`TurnErrorKind::Transport`]
    /// after; either one finishes the reader.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, TurnError>> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish("token revoked");
            return None;
        }

        let polled = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            item = self.stream.next() => Some(item),
        };
        let Some(item) = polled else {
            self.finish("token revoked while waiting");
            return None;
        };

        match item {
            None => {
                self.finish("end of stream");
                None
            }
            Some(Ok(event)) => {
                self.yielded += 1;
                if matches!(event, StreamEvent::StreamStarted) {
                    self.started = true;
                }
                if event.is_terminal() {
                    self.finish(event.kind());
                }
                Some(Ok(event))
            }
            Some(Err(error)) => {
                self.finish("transport error");
                if self.cancel.is_cancelled() {
                    return Some(Err(TurnError::cancelled()));
                }
                let kind = if self.started {
                    TurnErrorKind::Transport
                } else {
                    TurnErrorKind::Connection
                };
                Some(Err(TurnError::new(kind, error.to_string())))
            }
        }
    }

    /// Whether the backend confirmed the stream.
    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self, reason: &str) {
        self.finished = true;
        debug!(
            "Stream reader finished reason={reason} yielded={} started={}",
            self.yielded, self.started
        );
    }
}
