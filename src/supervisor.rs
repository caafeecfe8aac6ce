// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Main loop: connect, run, classify the failure, back off, reconnect.
//! Owns the shared HTTP client, the persisted sub-agent session pointer, and
//! the shutdown signal every task observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::{self, DispatcherContext};
use crate::error::{is_fatal_connection_error, BridgeError};
use crate::id::AscendingIdGenerator;
use crate::protocol::OutboundEvent;
use crate::session_store;
use crate::subagent::SubAgentClient;
use crate::transport::Transport;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const RECONNECT_BASE: u32 = 2;
const RECONNECT_CAP_SECS: u64 = 60;

pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let http_client = reqwest::Client::new();
    let subagent = Arc::new(SubAgentClient::new(http_client, config.opencode_port));

    let sub_agent_session_id = Arc::new(Mutex::new(load_persisted_session(&subagent).await));
    let id_gen = Arc::new(Mutex::new(AscendingIdGenerator::new()));
    let shutdown = Arc::new(Notify::new());
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    let mut reconnect_attempts: u32 = 0;

    while !shutdown_flag.load(Ordering::SeqCst) {
        match connect_and_run(&config, &subagent, &sub_agent_session_id, &id_gen, &shutdown, &shutdown_flag).await {
            Ok(()) => {
                reconnect_attempts = 0;
            }
            Err(e) => {
                if matches!(e.downcast_ref::<BridgeError>(), Some(BridgeError::SessionTerminated)) {
                    info!("session rejected by control plane (HTTP 410) - user can restore by sending a new prompt");
                    shutdown_flag.store(true, Ordering::SeqCst);
                    break;
                }
                if is_fatal_connection_error(&e) {
                    error!("fatal connection error, shutting down: {e}");
                    shutdown_flag.store(true, Ordering::SeqCst);
                    break;
                }
                warn!("transient connection error, will reconnect: {e}");
            }
        }

        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        reconnect_attempts += 1;
        let delay = Duration::from_secs(RECONNECT_CAP_SECS.min(RECONNECT_BASE.pow(reconnect_attempts) as u64));
        debug!(attempt = reconnect_attempts, delay_secs = delay.as_secs(), "backing off before reconnect");
        tokio::time::sleep(delay).await;
    }

    Ok(())
}

async fn load_persisted_session(subagent: &SubAgentClient) -> Option<String> {
    let path = session_store::pointer_path();
    let pointer = session_store::load(&path)?;
    match subagent.session_exists(&pointer).await {
        Ok(true) => Some(pointer),
        Ok(false) => {
            info!("persisted sub-agent session pointer is stale, discarding");
            session_store::clear(&path);
            None
        }
        Err(e) => {
            warn!("could not validate persisted sub-agent session: {e}");
            None
        }
    }
}

async fn connect_and_run(
    config: &BridgeConfig,
    subagent: &Arc<SubAgentClient>,
    sub_agent_session_id: &Arc<Mutex<Option<String>>>,
    id_gen: &Arc<Mutex<AscendingIdGenerator>>,
    shutdown: &Arc<Notify>,
    shutdown_flag: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut transport = Transport::connect(&config.ws_url(), &config.token, &config.sandbox_id).await?;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let ready = OutboundEvent::Ready { opencode_session_id: sub_agent_session_id.lock().await.clone() };
    transport.send(ready.to_frame(&config.sandbox_id)?);

    let ctx = DispatcherContext {
        config: config.clone(),
        subagent: subagent.clone(),
        outbound: outbound_tx.clone(),
        shutdown: shutdown.clone(),
        shutdown_flag: shutdown_flag.clone(),
    };

    let mut tasks = JoinSet::new();
    let mut prompt_tasks: Vec<(tokio::task::AbortHandle, String)> = Vec::new();
    let sandbox_id = config.sandbox_id.clone();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    let result: anyhow::Result<()> = loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                break Ok(());
            }

            _ = heartbeat.tick() => {
                let ev = OutboundEvent::Heartbeat { status: "ready" };
                transport.send(ev.to_frame(&sandbox_id)?);
            }

            Some(event) = outbound_rx.recv() => {
                transport.send(event.to_frame(&sandbox_id)?);
            }

            frame = transport.recv() => {
                match frame {
                    Ok(Some(text)) => {
                        if let Some(command) = dispatcher::decode(&text) {
                            if let Some(prompt_handle) = dispatcher::dispatch(&ctx, command, sub_agent_session_id.clone(), id_gen.clone(), &mut tasks).await {
                                prompt_tasks.push(prompt_handle);
                            }
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    };

    // Cooperative cancellation: any prompt task still running when the
    // connection tears down or shutdown fires must still report a terminal
    // frame, per the one-terminal-frame-per-prompt invariant.
    prompt_tasks.retain(|(handle, _)| !handle.is_finished());
    for (handle, message_id) in prompt_tasks {
        handle.abort();
        let _ = outbound_tx.send(OutboundEvent::ExecutionComplete {
            message_id,
            success: false,
            error: Some("Task was cancelled".to_string()),
        });
    }
    // Flush any terminal frames the cancellation above just enqueued.
    while let Ok(event) = outbound_rx.try_recv() {
        transport.send(event.to_frame(&sandbox_id)?);
    }

    while tasks.join_next().await.is_some() {}
    transport.close().await;
    result
}
