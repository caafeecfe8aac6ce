// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Decodes inbound control-plane frames and routes each to its handler.
//! `prompt` and `push` run as detached tasks tracked in a live set so the
//! read loop stays responsive; every detached task reports its outcome
//! through the shared outbound channel rather than touching the transport
//! directly, preserving the single-writer discipline.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::git::{self, GitUser};
use crate::id::AscendingIdGenerator;
use crate::prompt;
use crate::protocol::{InboundCommand, OutboundEvent};
use crate::session_store;
use crate::subagent::SubAgentClient;

pub struct DispatcherContext {
    pub config: BridgeConfig,
    pub subagent: Arc<SubAgentClient>,
    pub outbound: mpsc::UnboundedSender<OutboundEvent>,
    pub shutdown: Arc<tokio::sync::Notify>,
    pub shutdown_flag: Arc<std::sync::atomic::AtomicBool>,
}

/// Decodes one inbound frame. Malformed JSON is logged and the connection
/// stays up, per the `MalformedFrame` error class.
pub fn decode(frame: &str) -> Option<InboundCommand> {
    match serde_json::from_str(frame) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!("discarding malformed inbound frame: {e}");
            None
        }
    }
}

/// Dispatches one decoded command, spawning long-running handlers into
/// `tasks` so the caller's read loop is never blocked by them. Returns the
/// abort handle and control-plane message id of a spawned `prompt` task so
/// the caller can cancel it cooperatively on shutdown and still emit the
/// required terminal frame.
pub async fn dispatch(
    ctx: &DispatcherContext,
    command: InboundCommand,
    sub_agent_session_id: Arc<tokio::sync::Mutex<Option<String>>>,
    id_gen: Arc<tokio::sync::Mutex<AscendingIdGenerator>>,
    tasks: &mut JoinSet<()>,
) -> Option<(tokio::task::AbortHandle, String)> {
    match command {
        InboundCommand::Prompt { message_id, content, model, author } => {
            let ctx_subagent = ctx.subagent.clone();
            let outbound = ctx.outbound.clone();
            let sub_agent_session_id = sub_agent_session_id.clone();
            let id_gen = id_gen.clone();
            let repo_path = PathBuf::from("/workspace");
            let tracked_message_id = message_id.clone();

            let handle = tasks.spawn(async move {
                let git_user = author.and_then(|a| match (a.github_name, a.github_email) {
                    (Some(name), Some(email)) => Some(GitUser { name, email }),
                    _ => None,
                });
                git::configure_git_identity(&repo_path, git_user.as_ref()).await;

                let session_id = {
                    let mut guard = sub_agent_session_id.lock().await;
                    if guard.is_none() {
                        match ctx_subagent.create_session().await {
                            Ok(id) => {
                                let _ = session_store::save(&session_store::pointer_path(), &id);
                                *guard = Some(id.clone());
                            }
                            Err(e) => {
                                warn!("failed to create sub-agent session: {e}");
                                let _ = outbound.send(OutboundEvent::ExecutionComplete {
                                    message_id: message_id.clone(),
                                    success: false,
                                    error: Some(e.to_string()),
                                });
                                return;
                            }
                        }
                    }
                    guard.clone().expect("session id set above")
                };

                let our_ascending_id = {
                    let mut gen = id_gen.lock().await;
                    match gen.next("message") {
                        Ok(id) => id,
                        Err(e) => {
                            let _ = outbound.send(OutboundEvent::ExecutionComplete {
                                message_id: message_id.clone(),
                                success: false,
                                error: Some(e.to_string()),
                            });
                            return;
                        }
                    }
                };

                prompt::run_prompt(
                    &ctx_subagent,
                    &session_id,
                    our_ascending_id,
                    message_id,
                    &content,
                    model.as_deref(),
                    &outbound,
                )
                .await;
            });
            Some((handle, tracked_message_id))
        }
        InboundCommand::Stop => {
            let session_id = sub_agent_session_id.lock().await.clone();
            if let Some(session_id) = session_id {
                if let Err(e) = ctx.subagent.stop(&session_id).await {
                    warn!("stop request failed (swallowed): {e}");
                }
            }
            None
        }
        InboundCommand::Snapshot => {
            let session_id = sub_agent_session_id.lock().await.clone();
            let _ = ctx.outbound.send(OutboundEvent::SnapshotReady { opencode_session_id: session_id });
            None
        }
        InboundCommand::Shutdown => {
            info!("shutdown command received");
            ctx.shutdown_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            ctx.shutdown.notify_waiters();
            None
        }
        InboundCommand::GitSyncComplete => {
            info!("git sync complete signal received");
            None
        }
        InboundCommand::Push { branch_name, repo_owner, repo_name, github_token } => {
            let config = ctx.config.clone();
            let outbound = ctx.outbound.clone();
            tasks.spawn(async move {
                let repo_path = PathBuf::from("/workspace");
                let token = git::resolve_github_token(github_token.as_deref(), config.github_app_token.as_deref());
                let owner = repo_owner.or(config.repo_owner.clone());
                let name = repo_name.or(config.repo_name.clone());
                let event = git::handle_push(&repo_path, &branch_name, owner.as_deref(), name.as_deref(), token.as_deref()).await;
                let _ = outbound.send(event);
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_returns_none_on_malformed_json() {
        assert!(decode("not json").is_none());
    }

    #[test]
    fn decode_parses_stop_command() {
        let cmd = decode(r#"{"type":"stop"}"#).unwrap();
        assert!(matches!(cmd, InboundCommand::Stop));
    }
}
