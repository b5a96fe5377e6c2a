// =============================================================================
// Engine configuration
// =============================================================================
//
// Loaded from a JSON file when present, otherwise defaults. Every field
// carries `#[serde(default)]` so adding fields never breaks loading an older
// file. Environment overrides are applied in main.rs after loading.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::poller::DEFAULT_POLL_INTERVAL_MS;
use crate::series::DEFAULT_MAX_POINTS;
use crate::stream::DEFAULT_CONNECT_TIMEOUT_SECS;

fn default_rest_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_stream_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_max_points() -> usize {
    DEFAULT_MAX_POINTS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_instrument() -> String {
    "BTC".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the rates playground REST API.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// WebSocket URL of the streaming feed.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Points retained per series.
    #[serde(default = "default_max_points")]
    pub max_points: usize,

    /// Fallback polling cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long to wait for the stream transport to open.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Instrument the runner session tracks.
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// Currency the raw quote is denominated in.
    #[serde(default = "default_currency")]
    pub reference_currency: String,

    /// Currency the price is shown in; differs from the reference for
    /// cross-rate sessions.
    #[serde(default = "default_currency")]
    pub target_currency: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            stream_url: default_stream_url(),
            max_points: default_max_points(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            instrument: default_instrument(),
            reference_currency: default_currency(),
            target_currency: default_currency(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
