// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Server-Sent Events reader for the sub-agent's `/event` stream. Events are
//! separated by a blank line; `data:` lines within one event are joined with
//! `\n` before being decoded as JSON. Exposed as `next_event` rather than a
//! `Stream` impl since the one caller drives it in a single loop under an
//! outer deadline.

use serde_json::Value;
use tracing::warn;

pub struct SseReader {
    stream: reqwest::Response,
    buf: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self { stream: response, buf: String::new() }
    }

    /// Returns the next decoded event, or `None` once the stream closes.
    /// Malformed JSON within an event is logged and skipped, not fatal.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<Value>> {
        loop {
            if let Some(event) = self.take_complete_event() {
                if let Some(value) = decode_event(&event) {
                    return Ok(Some(value));
                }
                continue;
            }

            match self.stream.chunk().await? {
                Some(bytes) => self.buf.push_str(&String::from_utf8_lossy(&bytes)),
                None => {
                    // Stream closed; flush whatever partial event remains.
                    if self.buf.trim().is_empty() {
                        return Ok(None);
                    }
                    let remaining = std::mem::take(&mut self.buf);
                    return Ok(decode_event(&remaining));
                }
            }
        }
    }

    fn take_complete_event(&mut self) -> Option<String> {
        take_complete_event(&mut self.buf)
    }
}

fn take_complete_event(buf: &mut String) -> Option<String> {
    let pos = buf.find("\n\n")?;
    let event = buf[..pos].to_string();
    buf.drain(..pos + 2);
    Some(event)
}

/// Joins `data:` lines within one SSE event and decodes the result as JSON.
fn decode_event(event: &str) -> Option<Value> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    match serde_json::from_str(&payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("discarding malformed SSE event: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_line_decodes() {
        let event = "data: {\"type\":\"server.connected\"}";
        let value = decode_event(event).unwrap();
        assert_eq!(value["type"], "server.connected");
    }

    #[test]
    fn multi_line_data_is_joined_with_newline() {
        // Not valid JSON when joined, but asserts the join behavior itself.
        let event = "data: {\"a\":1,\ndata: \"b\":2}";
        let data: Vec<&str> = event
            .lines()
            .filter_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))
            .collect();
        assert_eq!(data.join("\n"), "{\"a\":1,\n\"b\":2}");
    }

    #[test]
    fn malformed_json_returns_none() {
        let event = "data: not json";
        assert!(decode_event(event).is_none());
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let event = "event: ping\ndata: {\"ok\":true}";
        let value = decode_event(event).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn concatenated_events_round_trip_in_order() {
        let objects = vec![
            serde_json::json!({"type": "a", "n": 1}),
            serde_json::json!({"type": "b", "n": 2}),
            serde_json::json!({"type": "c", "n": 3}),
        ];
        let mut buf: String = objects
            .iter()
            .map(|v| format!("data: {v}\n\n"))
            .collect();

        let mut decoded = Vec::new();
        while let Some(event) = take_complete_event(&mut buf) {
            if let Some(value) = decode_event(&event) {
                decoded.push(value);
            }
        }
        assert_eq!(decoded, objects);
    }
}
