// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod config;
mod dispatcher;
mod error;
mod git;
mod id;
mod prompt;
mod protocol;
mod session_store;
mod sse;
mod subagent;
mod supervisor;
mod transport;

use config::BridgeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load();
    init_logging();

    tracing::info!(sandbox_id = %config.sandbox_id, port = config.opencode_port, "starting agent bridge");

    supervisor::run(config).await
}

fn init_logging() {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).try_init();
}
