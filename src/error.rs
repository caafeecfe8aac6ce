// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Error taxonomy for the bridge. Transport-layer failures are classified as
//! fatal or transient by [`is_fatal_connection_error`]; everything else is
//! contained to its own handler and surfaced as an outbound event rather than
//! propagated up to the supervisor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection rejected by control plane (HTTP {0})")]
    FatalUpgrade(u16),

    #[error("control plane session was terminated (HTTP 410) - user can restore by sending a new prompt")]
    SessionTerminated,

    #[error("transport error: {0}")]
    Transient(String),

    #[error("prompt failed: {0}")]
    PromptFailure(String),

    #[error("prompt timed out")]
    TimedOut,

    #[error("push failed: {0}")]
    PushFailure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown ascending-id prefix: {0}")]
    UnknownPrefix(String),
}

/// Status codes the control plane upgrade returns that must never be retried.
const FATAL_UPGRADE_CODES: [u16; 4] = [401, 403, 404, 410];

pub fn is_fatal_upgrade_status(status: u16) -> bool {
    FATAL_UPGRADE_CODES.contains(&status)
}

/// Substring fallback for errors that only carry text, per the supervisor's
/// classification contract: inspect the textual representation for the
/// fatal HTTP status codes.
pub fn is_fatal_connection_error(err: &anyhow::Error) -> bool {
    if let Some(BridgeError::FatalUpgrade(_)) = err.downcast_ref::<BridgeError>() {
        return true;
    }
    if let Some(BridgeError::SessionTerminated) = err.downcast_ref::<BridgeError>() {
        return true;
    }
    let text = err.to_string();
    ["HTTP 401", "HTTP 403", "HTTP 404", "HTTP 410"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_fatal_upgrade_is_fatal() {
        let err = anyhow::Error::new(BridgeError::FatalUpgrade(401));
        assert!(is_fatal_connection_error(&err));
    }

    #[test]
    fn session_terminated_is_fatal() {
        let err = anyhow::Error::new(BridgeError::SessionTerminated);
        assert!(is_fatal_connection_error(&err));
    }

    #[test]
    fn substring_fallback_matches_embedded_status() {
        let err = anyhow::anyhow!("upgrade failed: HTTP 410 Gone");
        assert!(is_fatal_connection_error(&err));
    }

    #[test]
    fn transient_text_is_not_fatal() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert!(!is_fatal_connection_error(&err));
    }

    #[test]
    fn http_500_is_not_fatal() {
        let err = anyhow::anyhow!("upgrade failed: HTTP 500 Internal Server Error");
        assert!(!is_fatal_connection_error(&err));
    }

    #[test]
    fn is_fatal_upgrade_status_covers_all_four_codes() {
        for code in FATAL_UPGRADE_CODES {
            assert!(is_fatal_upgrade_status(code));
        }
        assert!(!is_fatal_upgrade_status(500));
        assert!(!is_fatal_upgrade_status(200));
    }
}
