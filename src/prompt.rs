// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The stream-correlation core. Given one outbound user prompt, attributes
//! the sub-agent's session-wide SSE stream back to that prompt alone and
//! emits the normalized outbound events, finishing with a reconciliation
//! fetch so no tail bytes are lost when the sub-agent goes idle.
//!
//! The correlation logic itself ([`apply_sse_event`], [`reconcile_final_state`])
//! is a pure function over [`PromptState`] and decoded JSON, independent of
//! the transport and the sub-agent client, so it can be driven directly by
//! synthetic events in tests.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::OutboundEvent;
use crate::subagent::SubAgentClient;

const PROMPT_DEADLINE: Duration = Duration::from_secs(300);

/// Per-prompt correlation state. Owned by the task handling one prompt;
/// discarded when that prompt completes.
pub struct PromptState {
    pub our_ascending_id: String,
    pub session_id: String,
    pub cumulative_text: HashMap<String, String>,
    pub emitted_tool_states: HashSet<String>,
    pub tracked_assistant_ids: HashSet<String>,
}

impl PromptState {
    pub fn new(our_ascending_id: String, session_id: String) -> Self {
        Self {
            our_ascending_id,
            session_id,
            cumulative_text: HashMap::new(),
            emitted_tool_states: HashSet::new(),
            tracked_assistant_ids: HashSet::new(),
        }
    }
}

/// What the stream-processing loop should do after handling one event.
pub enum LoopSignal {
    Continue,
    Idle,
    SessionError(String),
}

/// Applies one decoded SSE event to `state`, returning the outbound events
/// it produces and what the caller's loop should do next. Mirrors the
/// original sub-agent's event table exactly: ignore unrelated sessions,
/// track assistant replies by parent-link, accumulate text by delta-or-replace,
/// and de-duplicate tool-call states.
pub fn apply_sse_event(state: &mut PromptState, message_id: &str, raw: &Value) -> (Vec<OutboundEvent>, LoopSignal) {
    let event_type = raw["type"].as_str().unwrap_or("");
    let props = &raw["properties"];

    if event_type == "server.connected" || event_type == "server.heartbeat" {
        return (vec![], LoopSignal::Continue);
    }

    let event_session_id = props["sessionID"]
        .as_str()
        .or_else(|| props["part"]["sessionID"].as_str());
    if let Some(sid) = event_session_id {
        if sid != state.session_id {
            return (vec![], LoopSignal::Continue);
        }
    }

    match event_type {
        "message.updated" => {
            let info = &props["info"];
            let msg_session_id = info["sessionID"].as_str().unwrap_or("");
            if msg_session_id == state.session_id {
                let oc_msg_id = info["id"].as_str().unwrap_or("");
                let parent_id = info["parentID"].as_str().unwrap_or("");
                let role = info["role"].as_str().unwrap_or("");
                let finish = info["finish"].as_str().unwrap_or("");

                if role == "assistant" && parent_id == state.our_ascending_id && !oc_msg_id.is_empty() {
                    state.tracked_assistant_ids.insert(oc_msg_id.to_string());
                    debug!(id = oc_msg_id, "tracking assistant message via parentID match");
                }
                if !finish.is_empty() && finish != "tool-calls" {
                    debug!(finish, "sub-agent message finished");
                }
            }
            (vec![], LoopSignal::Continue)
        }
        "message.part.updated" => {
            let part = &props["part"];
            let delta = props["delta"].as_str();
            let part_type = part["type"].as_str().unwrap_or("");
            let part_id = part["id"].as_str().unwrap_or("").to_string();
            let oc_msg_id = part["messageID"].as_str().unwrap_or("");

            if !state.tracked_assistant_ids.is_empty() && !state.tracked_assistant_ids.contains(oc_msg_id) {
                return (vec![], LoopSignal::Continue);
            }

            let mut events = Vec::new();
            match part_type {
                "text" => {
                    let text = part["text"].as_str().unwrap_or("");
                    let entry = state.cumulative_text.entry(part_id).or_default();
                    if let Some(delta) = delta {
                        entry.push_str(delta);
                    } else {
                        *entry = text.to_string();
                    }
                    if !entry.is_empty() {
                        events.push(OutboundEvent::Token { message_id: message_id.to_string(), content: entry.clone() });
                    }
                }
                "tool" => {
                    let state_obj = &part["state"];
                    let status = state_obj["status"].as_str().unwrap_or("").to_string();
                    let input = &state_obj["input"];
                    let input_empty = input.is_null() || input.as_object().map(|o| o.is_empty()).unwrap_or(false);
                    let call_id = part["callID"].as_str().unwrap_or("").to_string();

                    if (status == "pending" || status.is_empty()) && input_empty {
                        // Not ready to emit: no input yet.
                    } else {
                        let key = format!("tool:{call_id}:{status}");
                        if state.emitted_tool_states.insert(key) {
                            events.push(OutboundEvent::ToolCall {
                                message_id: message_id.to_string(),
                                tool: part["tool"].as_str().unwrap_or("").to_string(),
                                args: input.clone(),
                                call_id,
                                status,
                                output: if state_obj["output"].is_null() { None } else { Some(state_obj["output"].clone()) },
                            });
                        }
                    }
                }
                "step-start" => {
                    events.push(OutboundEvent::StepStart { message_id: message_id.to_string() });
                }
                "step-finish" => {
                    events.push(OutboundEvent::StepFinish {
                        message_id: message_id.to_string(),
                        cost: part["cost"].as_f64(),
                        tokens: if part["tokens"].is_null() { None } else { Some(part["tokens"].clone()) },
                        reason: part["reason"].as_str().map(str::to_string),
                    });
                }
                _ => {}
            }
            (events, LoopSignal::Continue)
        }
        "session.idle" => {
            let idle_session_id = props["sessionID"].as_str().unwrap_or("");
            if idle_session_id == state.session_id {
                (vec![], LoopSignal::Idle)
            } else {
                (vec![], LoopSignal::Continue)
            }
        }
        "session.status" => {
            let status_session_id = props["sessionID"].as_str().unwrap_or("");
            let is_idle = props["status"]["type"].as_str() == Some("idle");
            if status_session_id == state.session_id && is_idle {
                (vec![], LoopSignal::Idle)
            } else {
                (vec![], LoopSignal::Continue)
            }
        }
        "session.error" => {
            let error_session_id = props["sessionID"].as_str().unwrap_or("");
            if error_session_id == state.session_id {
                let error = &props["error"];
                let message = error["message"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| error.as_str().map(str::to_string))
                    .unwrap_or_else(|| "Unknown error".to_string());
                (vec![], LoopSignal::SessionError(message))
            } else {
                (vec![], LoopSignal::Continue)
            }
        }
        _ => (vec![], LoopSignal::Continue),
    }
}

/// Post-idle reconciliation: re-fetches the session's message list and emits
/// a fresh `token` event for any text part whose full text grew beyond what
/// the stream already delivered. Uses the `parentID` link, falling back to
/// identifiers tracked during streaming for sub-agent builds that don't
/// always propagate `parentID`.
pub fn reconcile_final_state(state: &mut PromptState, message_id: &str, messages: &[Value]) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    for msg in messages {
        let info = &msg["info"];
        if info["role"].as_str().unwrap_or("") != "assistant" {
            continue;
        }
        let msg_id = info["id"].as_str().unwrap_or("");
        let parent_id = info["parentID"].as_str().unwrap_or("");
        let parent_matches = parent_id == state.our_ascending_id;
        let in_tracked = state.tracked_assistant_ids.contains(msg_id);
        if !parent_matches && !in_tracked {
            continue;
        }

        let empty = Vec::new();
        let parts = msg["parts"].as_array().unwrap_or(&empty);
        for part in parts {
            if part["type"].as_str() != Some("text") {
                continue;
            }
            let part_id = part["id"].as_str().unwrap_or("").to_string();
            let text = part["text"].as_str().unwrap_or("");
            let previously_sent = state.cumulative_text.get(&part_id).map(String::as_str).unwrap_or("");
            if text.len() > previously_sent.len() {
                state.cumulative_text.insert(part_id, text.to_string());
                events.push(OutboundEvent::Token { message_id: message_id.to_string(), content: text.to_string() });
            }
        }
    }
    events
}

/// Drives one prompt end to end: opens the SSE stream, submits the prompt,
/// runs the correlation loop under a wall-clock deadline, reconciles, and
/// always emits exactly one terminal frame.
pub async fn run_prompt(
    subagent: &SubAgentClient,
    session_id: &str,
    our_ascending_id: String,
    control_plane_message_id: String,
    content: &str,
    model: Option<&str>,
    outbound: &mpsc::UnboundedSender<OutboundEvent>,
) {
    let result = run_prompt_inner(subagent, session_id, &our_ascending_id, &control_plane_message_id, content, model, outbound).await;

    if let Err(e) = result {
        warn!(message_id = %control_plane_message_id, error = %e, "prompt failed");
        let _ = outbound.send(OutboundEvent::ExecutionComplete {
            message_id: control_plane_message_id,
            success: false,
            error: Some(e.to_string()),
        });
    }
}

async fn run_prompt_inner(
    subagent: &SubAgentClient,
    session_id: &str,
    our_ascending_id: &str,
    control_plane_message_id: &str,
    content: &str,
    model: Option<&str>,
    outbound: &mpsc::UnboundedSender<OutboundEvent>,
) -> anyhow::Result<()> {
    let mut sse = subagent.open_event_stream().await?;
    info!(message_id = %control_plane_message_id, "SSE connected, sending prompt");

    subagent.submit_prompt(session_id, content, our_ascending_id, model).await?;

    let mut state = PromptState::new(our_ascending_id.to_string(), session_id.to_string());
    let outcome = timeout(PROMPT_DEADLINE, async {
        loop {
            match sse.next_event().await? {
                None => return Ok(LoopSignal::Idle),
                Some(event) => {
                    let (events, signal) = apply_sse_event(&mut state, control_plane_message_id, &event);
                    for ev in events {
                        let _ = outbound.send(ev);
                    }
                    match signal {
                        LoopSignal::Continue => continue,
                        other => return Ok::<_, anyhow::Error>(other),
                    }
                }
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("prompt timed out"))??;

    match outcome {
        LoopSignal::SessionError(message) => {
            let _ = outbound.send(OutboundEvent::Error { message_id: control_plane_message_id.to_string(), error: message });
            let _ = outbound.send(OutboundEvent::ExecutionComplete {
                message_id: control_plane_message_id.to_string(),
                success: false,
                error: None,
            });
        }
        LoopSignal::Idle | LoopSignal::Continue => {
            let messages = subagent.fetch_messages(session_id).await.unwrap_or_default();
            for ev in reconcile_final_state(&mut state, control_plane_message_id, &messages) {
                let _ = outbound.send(ev);
            }
            let _ = outbound.send(OutboundEvent::ExecutionComplete {
                message_id: control_plane_message_id.to_string(),
                success: true,
                error: None,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> PromptState {
        PromptState::new("msg_our_id".to_string(), "ses_1".to_string())
    }

    #[test]
    fn server_events_are_ignored() {
        let mut st = state();
        let (events, _) = apply_sse_event(&mut st, "m1", &json!({"type": "server.connected"}));
        assert!(events.is_empty());
        let (events, _) = apply_sse_event(&mut st, "m1", &json!({"type": "server.heartbeat"}));
        assert!(events.is_empty());
    }

    #[test]
    fn message_updated_tracks_assistant_id_on_parent_match() {
        let mut st = state();
        let event = json!({
            "type": "message.updated",
            "properties": {"info": {"sessionID": "ses_1", "id": "asst_1", "parentID": "msg_our_id", "role": "assistant"}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        assert!(events.is_empty());
        assert!(st.tracked_assistant_ids.contains("asst_1"));
    }

    #[test]
    fn unrelated_session_is_ignored() {
        let mut st = state();
        let event = json!({
            "type": "message.part.updated",
            "properties": {"sessionID": "ses_other", "part": {"type": "text", "id": "p1", "text": "hi", "messageID": "asst_1"}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        assert!(events.is_empty());
    }

    #[test]
    fn cross_talk_filtered_when_message_id_not_tracked() {
        let mut st = state();
        st.tracked_assistant_ids.insert("asst_1".to_string());
        let event = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "text", "id": "p1", "text": "hi", "messageID": "asst_other"}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        assert!(events.is_empty());
    }

    #[test]
    fn text_delta_accumulates_and_emits_token() {
        let mut st = state();
        let e1 = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "text", "id": "p1", "messageID": "asst_1"}, "delta": "hello"}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &e1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Token { content, .. } => assert_eq!(content, "hello"),
            _ => panic!("expected Token"),
        }

        let e2 = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "text", "id": "p1", "messageID": "asst_1"}, "delta": " world"}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &e2);
        match &events[0] {
            OutboundEvent::Token { content, .. } => assert_eq!(content, "hello world"),
            _ => panic!("expected Token"),
        }
    }

    #[test]
    fn text_full_replace_without_delta() {
        let mut st = state();
        let event = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "text", "id": "p1", "text": "full text", "messageID": "asst_1"}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        match &events[0] {
            OutboundEvent::Token { content, .. } => assert_eq!(content, "full text"),
            _ => panic!("expected Token"),
        }
    }

    #[test]
    fn pending_tool_with_no_input_is_skipped() {
        let mut st = state();
        let event = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "tool", "callID": "c1", "tool": "bash", "messageID": "asst_1", "state": {"status": "pending", "input": {}}}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        assert!(events.is_empty());
    }

    #[test]
    fn tool_call_emitted_once_per_call_id_and_status() {
        let mut st = state();
        let event = json!({
            "type": "message.part.updated",
            "properties": {"part": {"type": "tool", "callID": "c1", "tool": "bash", "messageID": "asst_1", "state": {"status": "running", "input": {"cmd": "ls"}}}}
        });
        let (events, _) = apply_sse_event(&mut st, "m1", &event);
        assert_eq!(events.len(), 1);
        let (events_again, _) = apply_sse_event(&mut st, "m1", &event);
        assert!(events_again.is_empty());
    }

    #[test]
    fn session_idle_signals_idle() {
        let mut st = state();
        let event = json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}});
        let (events, signal) = apply_sse_event(&mut st, "m1", &event);
        assert!(events.is_empty());
        assert!(matches!(signal, LoopSignal::Idle));
    }

    #[test]
    fn session_status_idle_signals_idle() {
        let mut st = state();
        let event = json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "idle"}}});
        let (_, signal) = apply_sse_event(&mut st, "m1", &event);
        assert!(matches!(signal, LoopSignal::Idle));
    }

    #[test]
    fn session_error_signals_error_with_message() {
        let mut st = state();
        let event = json!({"type": "session.error", "properties": {"sessionID": "ses_1", "error": {"message": "boom"}}});
        let (_, signal) = apply_sse_event(&mut st, "m1", &event);
        match signal {
            LoopSignal::SessionError(msg) => assert_eq!(msg, "boom"),
            _ => panic!("expected SessionError"),
        }
    }

    #[test]
    fn reconciliation_emits_token_when_final_text_grew() {
        let mut st = state();
        st.cumulative_text.insert("p1".to_string(), "hello".to_string());
        let messages = vec![json!({
            "info": {"role": "assistant", "id": "asst_1", "parentID": "msg_our_id"},
            "parts": [{"type": "text", "id": "p1", "text": "hello world"}]
        })];
        let events = reconcile_final_state(&mut st, "m1", &messages);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Token { content, .. } => assert_eq!(content, "hello world"),
            _ => panic!("expected Token"),
        }
    }

    #[test]
    fn reconciliation_emits_nothing_when_text_did_not_grow() {
        let mut st = state();
        st.cumulative_text.insert("p1".to_string(), "hello world".to_string());
        let messages = vec![json!({
            "info": {"role": "assistant", "id": "asst_1", "parentID": "msg_our_id"},
            "parts": [{"type": "text", "id": "p1", "text": "hello world"}]
        })];
        let events = reconcile_final_state(&mut st, "m1", &messages);
        assert!(events.is_empty());
    }

    #[test]
    fn reconciliation_falls_back_to_tracked_ids_when_parent_id_absent() {
        let mut st = state();
        st.tracked_assistant_ids.insert("asst_1".to_string());
        let messages = vec![json!({
            "info": {"role": "assistant", "id": "asst_1"},
            "parts": [{"type": "text", "id": "p1", "text": "hi"}]
        })];
        let events = reconcile_final_state(&mut st, "m1", &messages);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn reconciliation_skips_messages_that_match_neither_index() {
        let mut st = state();
        let messages = vec![json!({
            "info": {"role": "assistant", "id": "asst_other", "parentID": "someone_else"},
            "parts": [{"type": "text", "id": "p1", "text": "hi"}]
        })];
        let events = reconcile_final_state(&mut st, "m1", &messages);
        assert!(events.is_empty());
    }
}
