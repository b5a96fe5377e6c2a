// =============================================================================
// ratesync — headless playground runner
// =============================================================================
//
// Keeps one realtime session alive for the configured instrument and logs a
// rendered snapshot line on every change notification (standing in for the
// chart collaborator). The session streams when the feed connects in time and
// polls otherwise.
// =============================================================================

mod config;
mod convert;
mod error;
mod poller;
mod rest;
mod series;
mod session;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::rest::{Market, RestFetcher};
use crate::session::{RealtimeSession, SessionDescriptor, SessionMode};
use crate::stream::{ChannelState, StreamChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::load("ratesync.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Env overrides for the common knobs.
    if let Ok(v) = std::env::var("RATESYNC_REST_BASE_URL") {
        config.rest_base_url = v;
    }
    if let Ok(v) = std::env::var("RATESYNC_STREAM_URL") {
        config.stream_url = v;
    }
    if let Ok(v) = std::env::var("RATESYNC_INSTRUMENT") {
        config.instrument = v;
    }
    if let Ok(v) = std::env::var("RATESYNC_TARGET_CURRENCY") {
        config.target_currency = v;
    }

    info!(
        instrument = %config.instrument,
        reference = %config.reference_currency,
        target = %config.target_currency,
        rest_base_url = %config.rest_base_url,
        "ratesync starting"
    );

    let fetcher = Arc::new(RestFetcher::new(&config.rest_base_url));
    let channel = Arc::new(StreamChannel::new(
        &config.stream_url,
        config.connect_timeout_secs,
    ));

    // One connection attempt; if it does not come up before the session
    // starts, the session polls. No auto-reconnect by design.
    let _stream_task = channel.spawn();
    let settle_deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.connect_timeout_secs);
    while channel.state() == ChannelState::Connecting
        && tokio::time::Instant::now() < settle_deadline
    {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Some(diag) = channel.diagnostic() {
        warn!(diagnostic = %diag, "stream not available, sessions will poll");
    }

    let descriptor = SessionDescriptor::new(
        Market::Crypto,
        &config.instrument,
        &config.reference_currency,
        &config.target_currency,
        SessionMode::Realtime,
    );
    let session = Arc::new(
        RealtimeSession::start(
            descriptor,
            fetcher,
            channel.clone(),
            config.max_points,
            config.poll_interval_ms,
        )
        .await,
    );

    // Render loop: one log line per change notification.
    let render_session = session.clone();
    let mut changes = session.subscribe_changes();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let snapshot = render_session.snapshot();
            let last = snapshot.last().copied();
            info!(
                status = %render_session.status(),
                points = snapshot.len(),
                last_time = last.map(|p| p.time).unwrap_or_default(),
                last_value = last.map(|p| p.value).unwrap_or_default(),
                "series updated"
            );
        }
    });

    info!("session running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    session.stop();
    channel.disconnect();
    info!("ratesync shut down");
    Ok(())
}
