// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between the bridge and the control plane. Inbound frames
//! decode as [`InboundCommand`]; outbound frames are built as
//! [`OutboundEvent`] and stamped with `sandboxId`/`timestamp` by
//! [`OutboundEvent::to_frame`] before send.
//!
//! Tag values are snake_case (`git_sync_complete`) but field names are
//! camelCase (`messageId`), so variants are renamed individually rather than
//! through a container-level `rename_all`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Deserialize)]
pub struct PromptAuthor {
    #[serde(rename = "githubName")]
    pub github_name: Option<String>,
    #[serde(rename = "githubEmail")]
    pub github_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundCommand {
    #[serde(rename = "prompt")]
    Prompt {
        #[serde(alias = "message_id", rename = "messageId")]
        message_id: String,
        content: String,
        model: Option<String>,
        author: Option<PromptAuthor>,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "shutdown")]
    Shutdown,
    #[serde(rename = "git_sync_complete")]
    GitSyncComplete,
    #[serde(rename = "push")]
    Push {
        #[serde(rename = "branchName")]
        branch_name: String,
        #[serde(rename = "repoOwner")]
        repo_owner: Option<String>,
        #[serde(rename = "repoName")]
        repo_name: Option<String>,
        #[serde(rename = "githubToken")]
        github_token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "opencodeSessionId")]
        opencode_session_id: Option<String>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { status: &'static str },
    #[serde(rename = "token")]
    Token {
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        #[serde(rename = "messageId")]
        message_id: String,
        tool: String,
        args: Value,
        #[serde(rename = "callId")]
        call_id: String,
        status: String,
        output: Option<Value>,
    },
    #[serde(rename = "step_start")]
    StepStart {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "step_finish")]
    StepFinish {
        #[serde(rename = "messageId")]
        message_id: String,
        cost: Option<f64>,
        tokens: Option<Value>,
        reason: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "messageId")]
        message_id: String,
        error: String,
    },
    #[serde(rename = "execution_complete")]
    ExecutionComplete {
        #[serde(rename = "messageId")]
        message_id: String,
        success: bool,
        error: Option<String>,
    },
    #[serde(rename = "snapshot_ready")]
    SnapshotReady {
        #[serde(rename = "opencodeSessionId")]
        opencode_session_id: Option<String>,
    },
    #[serde(rename = "push_complete")]
    PushComplete {
        #[serde(rename = "branchName")]
        branch_name: String,
    },
    #[serde(rename = "push_error")]
    PushError {
        #[serde(rename = "branchName")]
        branch_name: Option<String>,
        error: String,
    },
}

impl OutboundEvent {
    /// Serializes the event and stamps it with the sandbox id and the
    /// current wall-clock time, as required of every outbound frame.
    pub fn to_frame(&self, sandbox_id: &str) -> anyhow::Result<String> {
        let mut value = serde_json::to_value(self)?;
        let obj = value.as_object_mut().expect("event variants serialize to objects");
        obj.insert("sandboxId".to_string(), Value::String(sandbox_id.to_string()));
        obj.insert("timestamp".to_string(), Value::from(unix_timestamp_secs()));
        Ok(serde_json::to_string(&value)?)
    }
}

fn unix_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
