// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed wrapper over the sub-agent's loopback HTTP + SSE API.

use serde_json::{json, Value};
use std::time::Duration;

use crate::sse::SseReader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SubAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl SubAgentClient {
    pub fn new(client: reqwest::Client, port: u16) -> Self {
        Self { client, base_url: format!("http://localhost:{port}") }
    }

    pub async fn create_session(&self) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("sub-agent session response missing id"))
    }

    /// Validates a previously persisted session pointer. Returns `true` if
    /// the sub-agent still recognizes it.
    pub async fn session_exists(&self, session_id: &str) -> anyhow::Result<bool> {
        let resp = self
            .client
            .get(format!("{}/session/{session_id}", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    pub async fn open_event_stream(&self) -> anyhow::Result<SseReader> {
        let resp = self
            .client
            .get(format!("{}/event", self.base_url))
            .timeout(STREAM_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("sub-agent event stream upgrade failed: HTTP {}", resp.status().as_u16());
        }
        Ok(SseReader::new(resp))
    }

    pub async fn submit_prompt(
        &self,
        session_id: &str,
        content: &str,
        message_id: &str,
        model: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut body = json!({
            "parts": [{"type": "text", "text": content}],
            "messageID": message_id,
        });
        if let Some(model) = model {
            body["model"] = encode_model(model);
        }

        let resp = self
            .client
            .post(format!("{}/session/{session_id}/prompt_async", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() != 200 && status.as_u16() != 204 {
            anyhow::bail!("prompt_async returned HTTP {}", status.as_u16());
        }
        Ok(())
    }

    pub async fn fetch_messages(&self, session_id: &str) -> anyhow::Result<Vec<Value>> {
        let resp = self
            .client
            .get(format!("{}/session/{session_id}/message", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    /// Best-effort cancel; callers swallow errors per the dispatcher's
    /// fire-and-forget contract for `stop`.
    pub async fn stop(&self, session_id: &str) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/session/{session_id}/stop", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await?;
        Ok(())
    }
}

/// Splits `provider/model` once; a bare string defaults to the `anthropic`
/// provider.
fn encode_model(model: &str) -> Value {
    match model.split_once('/') {
        Some((provider_id, model_id)) => json!({"providerID": provider_id, "modelID": model_id}),
        None => json!({"providerID": "anthropic", "modelID": model}),
    }
}
