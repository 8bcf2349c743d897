//! Incremental `text/event-stream` decoding.
//!
//! Bytes arrive in arbitrary chunks; events are separated by a blank line.
//! Each event's `data:` lines are joined and parsed as a JSON
//! [`StreamEvent`]. Other SSE fields (`event:`, `id:`, `retry:`) and comment
//! lines carry nothing the controller needs and are skipped.

use crate::events::StreamEvent;
use log::warn;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Bytes of an incomplete UTF-8 sequence split across chunks.
    pending_bytes: Vec<u8>,
    skipped: u64,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending_bytes.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending_bytes) {
            Ok(text) => text.len(),
            Err(error) if error.error_len().is_none() => error.valid_up_to(),
            Err(_) => self.pending_bytes.len(),
        };
        let tail = self.pending_bytes.split_off(valid_up_to);
        self.buffer
            .push_str(&String::from_utf8_lossy(&self.pending_bytes));
        self.pending_bytes = tail;

        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = self.parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if !self.pending_bytes.is_empty() {
            let bytes = std::mem::take(&mut self.pending_bytes);
            self.buffer.push_str(&String::from_utf8_lossy(&bytes));
        }
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            return None;
        }
        self.parse_block(remaining)
    }

    /// Number of payloads that could not be decoded.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    fn parse_block(&mut self, block: &str) -> Option<StreamEvent> {
        let data: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();
        if data.is_empty() {
            return None;
        }

        let payload = data.join("\n");
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }

        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => Some(event),
            Err(e) => {
                self.skipped += 1;
                warn!(
                    "Skipping undecodable stream payload error={e} payload_preview={}",
                    payload.chars().take(100).collect::<String>()
                );
                None
            }
        }
    }
}
