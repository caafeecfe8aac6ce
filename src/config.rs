// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bridge configuration: CLI flags with environment-variable fallbacks. No
//! file-based layer — the bridge's entire configuration surface is the
//! process command line plus environment, matching the collaborator that
//! launches it inside the sandbox.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "sandbox-bridge", about = "Control-plane-to-sandbox agent bridge")]
pub struct BridgeConfig {
    /// Identifier of the sandbox this process runs inside.
    #[arg(long, env = "SANDBOX_ID")]
    pub sandbox_id: String,

    /// The control plane's session id for this sandbox's WebSocket link.
    #[arg(long)]
    pub session_id: String,

    /// Base URL of the control plane, e.g. `wss://control.example.com` or
    /// `https://control.example.com` (rewritten to `wss://`).
    #[arg(long, env = "CONTROL_PLANE_URL")]
    pub control_plane: String,

    /// Bearer token used to authenticate the WebSocket upgrade.
    #[arg(long, env = "SANDBOX_AUTH_TOKEN")]
    pub token: String,

    /// Port the local sub-agent HTTP/SSE server listens on.
    #[arg(long, default_value_t = 4096, env = "OPENCODE_PORT")]
    pub opencode_port: u16,

    #[arg(skip)]
    pub repo_owner: Option<String>,

    #[arg(skip)]
    pub repo_name: Option<String>,

    #[arg(skip)]
    pub github_app_token: Option<String>,

    #[arg(skip)]
    pub session_config: Option<String>,

    #[arg(skip)]
    pub restored_from_snapshot: Option<bool>,
}

impl BridgeConfig {
    /// Reads the CLI flags plus the environment inputs that clap's `env`
    /// attribute doesn't cover (fields consumed by collaborators, not the
    /// core, but surfaced here for debug visibility).
    pub fn load() -> Self {
        let mut config = Self::parse();
        config.repo_owner = std::env::var("REPO_OWNER").ok();
        config.repo_name = std::env::var("REPO_NAME").ok();
        config.github_app_token = std::env::var("GITHUB_APP_TOKEN").ok();
        config.session_config = std::env::var("SESSION_CONFIG").ok();
        config.restored_from_snapshot = std::env::var("RESTORED_FROM_SNAPSHOT")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        config
    }

    /// `control_plane` rewritten to a WebSocket scheme and pointed at the
    /// session's sandbox endpoint.
    pub fn ws_url(&self) -> String {
        let base = rewrite_to_ws_scheme(&self.control_plane);
        format!("{base}/sessions/{}/ws?type=sandbox", self.session_id)
    }
}

/// Rewrites an `http(s)://` URL to the matching `ws(s)://` scheme; URLs
/// already using a `ws` scheme pass through unchanged.
pub fn rewrite_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_https_to_wss() {
        assert_eq!(rewrite_to_ws_scheme("https://control.example.com"), "wss://control.example.com");
    }

    #[test]
    fn rewrites_http_to_ws() {
        assert_eq!(rewrite_to_ws_scheme("http://control.example.com"), "ws://control.example.com");
    }

    #[test]
    fn leaves_ws_scheme_untouched() {
        assert_eq!(rewrite_to_ws_scheme("wss://control.example.com"), "wss://control.example.com");
    }
}
