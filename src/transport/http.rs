//! HTTP implementation of the chat backend.
//!
//! [`HttpBackend`] talks to the assistant server with JSON requests and a
//! `text/event-stream` response per turn. It implements both
//! [`TurnTransport`] and [`HistoryStore`] for one chat.

use super::sse::SseDecoder;
use super::{EventStream, StreamRequest, TurnTransport};
use crate::events::StreamEvent;
use crate::stores::{HistoryStore, UserAnchor};
use crate::types::{ChatId, Message, MessageTimestamp, TurnError};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const UNEXPECTED_END: &str = "Stream ended unexpectedly without completion";

#[derive(Serialize)]
struct TimestampBody<'a> {
    timestamp: &'a MessageTimestamp,
}

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<Message>,
}

/// Chat backend reached over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    chat_id: ChatId,
}

impl HttpBackend {
    #[must_use]
    pub fn new(base_url: impl Into<String>, chat_id: ChatId) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, chat_id)
    }

    /// Use a caller-configured client (proxies, timeouts, cookies).
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, chat_id: ChatId) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            client,
            base_url,
            chat_id,
        }
    }

    #[must_use]
    pub const fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    fn chat_url(&self, chat_id: &ChatId, path: &str) -> String {
        format!("{}/api/chats/{chat_id}/{path}", self.base_url)
    }

    async fn fetch_messages(&self, raw: bool) -> Result<Vec<Message>> {
        let mut request = self.client.get(self.chat_url(&self.chat_id, "messages"));
        if raw {
            request = request.query(&[("raw", "true")]);
        }
        let response = request.send().await.context("history request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, raw, "History fetch failed");
            bail!("history fetch failed with status {status}");
        }
        let body: HistoryResponse = response
            .json()
            .await
            .context("history response was not valid JSON")?;
        Ok(body.messages)
    }

    async fn post_delete<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(self.chat_url(&self.chat_id, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{path} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, path, "Delete failed");
            bail!("{path} failed with status {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl TurnTransport for HttpBackend {
    async fn open_stream(
        &self,
        request: &StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        tracing::debug!(
            chat_id = %request.chat_id,
            kind = %request.kind,
            has_prefill = request.prefill.is_some(),
            "Opening turn stream"
        );

        let send = self
            .client
            .post(self.chat_url(&request.chat_id, "stream"))
            .header("Accept", "text/event-stream")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => bail!(TurnError::CANCELLED_REASON),
            response = send => response.context("stream request failed")?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                tracing::error!(status = %status, body = %body, "Turn stream server error");
            } else {
                tracing::warn!(status = %status, body = %body, "Turn stream client error");
            }
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            let event = StreamEvent::error(message, Some(status.as_u16()));
            return Ok(Box::pin(futures::stream::once(async move { Ok(event) })));
        }

        Ok(decode_body(response.bytes_stream(), cancel))
    }

    async fn notify_cancel(&self, chat_id: &ChatId) -> Result<()> {
        let response = self
            .client
            .post(self.chat_url(chat_id, "cancel"))
            .send()
            .await
            .context("cancel request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("cancel request failed with status {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for HttpBackend {
    async fn history(&self) -> Result<Vec<Message>> {
        self.fetch_messages(false).await
    }

    async fn raw_history(&self) -> Result<Vec<Message>> {
        self.fetch_messages(true).await
    }

    async fn delete_from_user(&self, anchor: &UserAnchor) -> Result<()> {
        self.post_delete("messages/delete-from-user", anchor).await
    }

    async fn delete_from_assistant(&self, timestamp: &MessageTimestamp) -> Result<()> {
        self.post_delete("messages/delete-from-assistant", &TimestampBody { timestamp })
            .await
    }

    async fn delete_assistant_message(&self, timestamp: &MessageTimestamp) -> Result<()> {
        self.post_delete("messages/delete-assistant", &TimestampBody { timestamp })
            .await
    }
}

/// Decode a `text/event-stream` body into protocol events.
///
/// A body that ends before `done` or `error` yields a transport error, so the
/// reader classifies it like any other broken stream.
fn decode_body<S, B, E>(bytes: S, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut decoder = SseDecoder::new();
        let mut saw_terminal = false;
        let mut chunk_count: u64 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                chunk = bytes.next() => Some(chunk),
            };
            let Some(chunk) = polled else {
                tracing::debug!(chunk_count, "Turn stream aborted by cancellation");
                yield Err(anyhow!(TurnError::CANCELLED_REASON));
                return;
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, chunk_count, "Turn stream read failed");
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            };
            chunk_count += 1;

            for event in decoder.push(chunk.as_ref()) {
                saw_terminal |= event.is_terminal();
                yield Ok(event);
            }
        }

        if let Some(event) = decoder.finish() {
            saw_terminal |= event.is_terminal();
            yield Ok(event);
        }

        if !saw_terminal {
            tracing::warn!(chunk_count, "Turn stream ended without a terminal event");
            yield Err(anyhow!(UNEXPECTED_END));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let backend = HttpBackend::new("http://localhost:8080/", ChatId::from_string("c1"));
        assert_eq!(
            backend.chat_url(backend.chat_id(), "stream"),
            "http://localhost:8080/api/chats/c1/stream"
        );
    }

    #[test]
    fn delete_bodies_serialize_like_the_server_expects() -> Result<()> {
        let anchor = UserAnchor {
            content: "What's 2+2?".into(),
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_string(&anchor)?,
            r#"{"content":"What's 2+2?"}"#
        );

        let timestamp = MessageTimestamp::new("t6");
        assert_eq!(
            serde_json::to_string(&TimestampBody {
                timestamp: &timestamp
            })?,
            r#"{"timestamp":"t6"}"#
        );
        Ok(())
    }

    #[test]
    fn history_response_parses_messages() -> Result<()> {
        let body: HistoryResponse = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"Hello","timestamp":"t1"}]}"#,
        )?;
        assert_eq!(body.messages.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_open() {
        let backend = HttpBackend::new("http://127.0.0.1:9", ChatId::from_string("c1"));
        let token = CancellationToken::new();
        token.cancel();
        let request = StreamRequest::new(
            ChatId::from_string("c1"),
            &crate::types::TurnRequest::send("hi"),
            &crate::types::ChatSettings::default(),
        );
        let Err(error) = backend.open_stream(&request, token).await else {
            panic!("expected cancellation");
        };
        assert_eq!(error.to_string(), TurnError::CANCELLED_REASON);
    }

    fn body(chunks: &[&'static str]) -> EventStream {
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> =
            chunks.iter().map(|c| Ok((*c).as_bytes())).collect();
        decode_body(futures::stream::iter(chunks), CancellationToken::new())
    }

    #[tokio::test]
    async fn body_without_terminal_event_is_a_transport_error() {
        let mut reader = crate::transport::StreamReader::new(
            body(&[
                "data: {\"type\":\"stream_started\"}\n\n",
                "data: {\"type\":\"delta\",\"text\":\"cut\"}\n\n",
            ]),
            CancellationToken::new(),
        );

        assert!(matches!(reader.next().await, Some(Ok(StreamEvent::StreamStarted))));
        assert!(matches!(reader.next().await, Some(Ok(StreamEvent::Delta { .. }))));
        let Some(Err(error)) = reader.next().await else {
            panic!("expected a transport error");
        };
        assert_eq!(error.kind, crate::types::TurnErrorKind::Transport);
        assert_eq!(error.message, UNEXPECTED_END);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn body_with_done_has_no_trailing_error() {
        let events: Vec<_> = body(&["data: {\"type\":\"done\",\"ephemeral\":false}\n\n"])
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done { ephemeral: false })));
    }
}
