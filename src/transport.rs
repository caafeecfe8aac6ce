// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Authenticated bidirectional WebSocket link to the control plane. Ping/pong
//! liveness runs on a 20s interval with a 10s pong timeout; a stalled
//! connection is surfaced to the caller as a transient disconnect rather than
//! hanging forever.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{is_fatal_upgrade_status, BridgeError};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Transport {
    write_tx: mpsc::UnboundedSender<Message>,
    read: SplitStream<WsStream>,
    last_pong_millis: Arc<AtomicI64>,
    _writer: tokio::task::JoinHandle<()>,
    _pinger: tokio::task::JoinHandle<()>,
}

impl Transport {
    pub async fn connect(url: &str, token: &str, sandbox_id: &str) -> Result<Self, BridgeError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {token}")
                .parse()
                .map_err(|_| BridgeError::Configuration("invalid auth token".to_string()))?,
        );
        headers.insert(
            "X-Sandbox-ID",
            sandbox_id
                .parse()
                .map_err(|_| BridgeError::Configuration("invalid sandbox id".to_string()))?,
        );

        let (stream, response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                let status = resp.status().as_u16();
                return Err(classify_upgrade_failure(status));
            }
            Err(e) => return Err(BridgeError::Transient(e.to_string())),
        };

        let status = response.status().as_u16();
        if is_fatal_upgrade_status(status) {
            return Err(classify_upgrade_failure(status));
        }

        let (sink, read) = stream.split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(sink, write_rx);

        let last_pong_millis = Arc::new(AtomicI64::new(now_millis()));
        let pinger = spawn_pinger(write_tx.clone());

        Ok(Self { write_tx, read, last_pong_millis, _writer: writer, _pinger: pinger })
    }

    /// Sends a text frame; a no-op with a warning if the write side has
    /// already gone away.
    pub fn send(&self, frame: String) {
        if self.write_tx.send(Message::Text(frame)).is_err() {
            warn!("dropped outbound frame: transport is not open");
        }
    }

    /// Returns the next inbound text frame, skipping control frames.
    /// Non-JSON payloads are the caller's concern to discard; this layer
    /// only distinguishes "a frame arrived" from "the connection ended".
    ///
    /// Each read is bounded by the pong deadline so a peer that stops
    /// answering pings and sends nothing else is still caught, rather than
    /// relying on a check that only runs once a frame shows up.
    pub async fn recv(&mut self) -> Result<Option<String>, BridgeError> {
        loop {
            let since_pong = now_millis() - self.last_pong_millis.load(Ordering::Relaxed);
            let remaining = (PING_INTERVAL + PONG_TIMEOUT).as_millis() as i64 - since_pong;
            if remaining <= 0 {
                return Err(BridgeError::Transient("pong timeout".to_string()));
            }

            let next = match tokio::time::timeout(Duration::from_millis(remaining as u64), self.read.next()).await {
                Ok(next) => next,
                Err(_) => return Err(BridgeError::Transient("pong timeout".to_string())),
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Pong(_))) => {
                    self.last_pong_millis.store(now_millis(), Ordering::Relaxed);
                }
                Some(Ok(Message::Ping(_))) => {
                    // tokio-tungstenite answers pings automatically at the
                    // protocol level; nothing to do here.
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BridgeError::Transient(e.to_string())),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.write_tx.send(Message::Close(None));
        // Drain until the peer acknowledges the close or the stream ends.
        while let Ok(Some(_)) = self.recv().await {}
    }
}

fn classify_upgrade_failure(status: u16) -> BridgeError {
    if status == 410 {
        BridgeError::SessionTerminated
    } else if is_fatal_upgrade_status(status) {
        BridgeError::FatalUpgrade(status)
    } else {
        BridgeError::Transient(format!("HTTP {status}"))
    }
}

fn spawn_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("transport writer stopped: {e}");
                break;
            }
        }
    })
}

fn spawn_pinger(write_tx: mpsc::UnboundedSender<Message>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            if write_tx.send(Message::Ping(Vec::new())).is_err() {
                break;
            }
        }
    })
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_410_as_session_terminated() {
        assert!(matches!(classify_upgrade_failure(410), BridgeError::SessionTerminated));
    }

    #[test]
    fn classify_401_as_fatal_upgrade() {
        assert!(matches!(classify_upgrade_failure(401), BridgeError::FatalUpgrade(401)));
    }

    #[test]
    fn classify_500_as_transient() {
        assert!(matches!(classify_upgrade_failure(500), BridgeError::Transient(_)));
    }
}
