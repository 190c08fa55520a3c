//! Response delivery: chunking to the LoRa payload limit and routing back
//! over the right transport.
//!
//! Responses are chunked to 140 UTF-8 bytes, at most three chunks, with
//! multi-chunk responses prefixed `(i/N) ` and a 12-second gap between
//! chunks for radio air-time. Responses addressed to the operator's own
//! callsign go straight to the UI instead of the radio.

use serde_json::json;
use tracing::debug;

use super::CommandEngine;
use crate::message::OutboundMessage;
use crate::router::{RouterEvent, Topic};

/// Chunk payload limit, UTF-8 bytes.
pub const MAX_RESPONSE_BYTES: usize = 140;
/// Upper bound on chunks per response.
pub const MAX_CHUNKS: usize = 3;
/// Air-time gap between chunks.
pub const CHUNK_GAP_SECS: u64 = 12;

impl CommandEngine {
    /// Send a response to its recipient, chunking when necessary.
    pub(crate) async fn send_response(&self, response: &str, recipient: &str, src_type: &str) {
        if response.is_empty() {
            return;
        }

        let chunks = chunk_response(response);
        let total = chunks.len().min(MAX_CHUNKS);

        for (i, chunk) in chunks.into_iter().take(MAX_CHUNKS).enumerate() {
            let body = if total > 1 {
                format!("({}/{}) {}", i + 1, total, chunk)
            } else {
                chunk
            };

            if recipient.eq_ignore_ascii_case(&self.my_callsign) {
                // Self-response: the UI is the requester.
                let payload = json!({
                    "src": self.my_callsign,
                    "dst": recipient,
                    "msg": body,
                    "src_type": "ble",
                    "type": "msg",
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                });
                self.router
                    .publish("command", Topic::WebsocketMessage, RouterEvent::Status(payload))
                    .await;
            } else {
                let mut out = OutboundMessage::new(recipient, &body, "command_response");
                let topic = match src_type {
                    "ble" | "ble_remote" => Topic::BleMessage,
                    _ => {
                        out.src_type = "command_response_udp".to_string();
                        Topic::UdpMessage
                    }
                };
                self.router
                    .publish("command", topic, RouterEvent::Outbound(out))
                    .await;
            }
            debug!(chunk = i + 1, total, recipient, "response chunk sent");

            if i + 1 < total {
                tokio::time::sleep(std::time::Duration::from_secs(CHUNK_GAP_SECS)).await;
            }
        }
    }
}

/// Split a response into byte-bounded chunks.
///
/// Splitting prefers the two-line padding separator (`", "` with exactly
/// two halves), then station boundaries (`" | "`), then a plain byte split.
pub fn chunk_response(response: &str) -> Vec<String> {
    if response.len() <= MAX_RESPONSE_BYTES {
        return vec![response.to_string()];
    }

    let two_lines: Vec<&str> = response.split(", ").collect();
    if two_lines.len() == 2 {
        return two_lines.into_iter().map(str::to_string).collect();
    }

    if response.contains(" | ") {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for part in response.split(" | ") {
            let candidate_len = if current.is_empty() {
                part.len()
            } else {
                current.len() + 3 + part.len()
            };
            if candidate_len <= MAX_RESPONSE_BYTES {
                if !current.is_empty() {
                    current.push_str(" | ");
                }
                current.push_str(part);
            } else {
                if !current.is_empty() {
                    chunks.push(current.clone());
                }
                current = part.to_string();
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks.truncate(MAX_CHUNKS);
        return chunks;
    }

    // Byte split on char boundaries.
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in response.chars() {
        if current.len() + ch.len_utf8() > MAX_RESPONSE_BYTES {
            chunks.push(std::mem::take(&mut current));
            if chunks.len() == MAX_CHUNKS {
                return chunks;
            }
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks.truncate(MAX_CHUNKS);
    chunks
}

/// Pad a line so the next chunk starts on a clean boundary; used by the
/// two-line `!mheard` rendering.
pub fn pad_for_chunk_break(text: &str) -> String {
    let target = MAX_RESPONSE_BYTES - 2;
    let len = text.len();
    if len < target {
        format!("{}{}, ", text, " ".repeat(target - len))
    } else {
        format!("{text}, ")
    }
}
