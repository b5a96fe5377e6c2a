// =============================================================================
// StreamChannel — push-based market data connection
// =============================================================================
//
// Lifecycle state machine over one WebSocket connection:
//
//   Disconnected --connect()--> Connecting --open--> Connected
//        ^                          |                    |
//        |                          +--5s elapsed--> Timeout (transport closed)
//        +------- close ------------+----- error -----> Error
//
// The channel never auto-reconnects. Callers (sessions) react to
// Error/Timeout/Disconnected by falling back to polling; a fresh `spawn` is an
// explicit caller decision.
//
// Inbound trade payloads:
//   { "type": "trade", "data": [{ "s": symbol, "p": price, "t": epoch_millis }] }
// Outbound control messages:
//   { "type": "subscribe" | "unsubscribe", "symbol": ... }
//
// Decoded updates for subscribed symbols fan out to every session listener via
// a broadcast channel; each session filters for its own instrument.
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::series::Point;
use std::sync::Arc;

/// Default number of seconds to wait for the transport to open.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Capacity of the trade-update fan-out channel. Lagging listeners drop the
/// oldest updates, which is acceptable for a last-value chart feed.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle state. Transitions happen only through the channel's
/// event handlers; there is no external direct mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Timeout,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One decoded trade/quote update from the stream.
#[derive(Debug, Clone)]
pub struct TradeUpdate {
    pub symbol: String,
    pub point: Point,
}

pub struct StreamChannel {
    url: String,
    connect_timeout_secs: u64,
    state: RwLock<ChannelState>,
    /// Last transport error or abnormal-close reason, for user-visible
    /// diagnostics. Cleared when a connection opens.
    diagnostic: RwLock<Option<String>>,
    subscriptions: RwLock<HashSet<String>>,
    /// Control-message sink into the active transport writer, present only
    /// while a connection is up.
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    updates: broadcast::Sender<TradeUpdate>,
}

impl StreamChannel {
    pub fn new(url: impl Into<String>, connect_timeout_secs: u64) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            url: url.into(),
            connect_timeout_secs,
            state: RwLock::new(ChannelState::Disconnected),
            diagnostic: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            outbound: RwLock::new(None),
            updates,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn diagnostic(&self) -> Option<String> {
        self.diagnostic.read().clone()
    }

    /// Snapshot of the currently subscribed symbols.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions.read().clone()
    }

    /// New receiver for decoded trade updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TradeUpdate> {
        self.updates.subscribe()
    }

    /// Spawn the transport driver for this channel. One connection attempt;
    /// the task ends when the connection ends.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move { run_stream(channel).await })
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Send a subscribe control message and record the symbol. No-op unless
    /// the channel is connected.
    pub fn subscribe(&self, symbol: &str) {
        if self.state() != ChannelState::Connected {
            debug!(symbol, state = %self.state(), "subscribe ignored: channel not connected");
            return;
        }
        if self.send_control("subscribe", symbol) {
            self.subscriptions.write().insert(symbol.to_string());
            info!(symbol, "subscribed");
        }
    }

    /// Send an unsubscribe control message and drop the symbol. No-op unless
    /// the channel is connected.
    pub fn unsubscribe(&self, symbol: &str) {
        if self.state() != ChannelState::Connected {
            debug!(symbol, state = %self.state(), "unsubscribe ignored: channel not connected");
            return;
        }
        if self.send_control("unsubscribe", symbol) {
            self.subscriptions.write().remove(symbol);
            info!(symbol, "unsubscribed");
        }
    }

    /// Close the transport unconditionally, clear the subscription set, and
    /// return to `Disconnected`.
    pub fn disconnect(&self) {
        if let Some(tx) = self.outbound.write().take() {
            let _ = tx.send(Message::Close(None));
        }
        self.subscriptions.write().clear();
        *self.state.write() = ChannelState::Disconnected;
        info!("stream channel disconnected");
    }

    fn send_control(&self, kind: &str, symbol: &str) -> bool {
        let payload = serde_json::json!({ "type": kind, "symbol": symbol }).to_string();
        match self.outbound.read().as_ref() {
            Some(tx) => tx.send(Message::Text(payload)).is_ok(),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Transport event handlers
    // -------------------------------------------------------------------------

    /// Disconnected/Error/Timeout -> Connecting. Returns false (and leaves the
    /// state alone) if a connection attempt is already in flight or open.
    pub(crate) fn begin_connect(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            ChannelState::Connecting | ChannelState::Connected => false,
            _ => {
                *state = ChannelState::Connecting;
                true
            }
        }
    }

    /// Transport opened: Connecting -> Connected, diagnostics cleared.
    pub(crate) fn on_open(&self) {
        let mut state = self.state.write();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Connected;
            *self.diagnostic.write() = None;
            info!(url = %self.url, "stream connected");
        }
    }

    /// Transport error: any state -> Error, message preserved. Does not by
    /// itself close the transport.
    pub(crate) fn on_error(&self, message: &str) {
        *self.state.write() = ChannelState::Error;
        *self.diagnostic.write() = Some(message.to_string());
        error!(error = message, "stream error");
    }

    /// Transport closed: any state -> Disconnected, subscriptions emptied. An
    /// abnormal close keeps its reason as diagnostic text.
    pub(crate) fn on_close(&self, normal: bool, reason: Option<String>) {
        *self.state.write() = ChannelState::Disconnected;
        self.subscriptions.write().clear();
        *self.outbound.write() = None;
        if !normal {
            let reason = reason.unwrap_or_else(|| "abnormal close".to_string());
            warn!(reason = %reason, "stream closed abnormally");
            *self.diagnostic.write() = Some(reason);
        } else {
            debug!("stream closed");
        }
    }

    /// Connect timer fired while the attempt is still pending: -> Timeout.
    /// Any other state means the attempt already resolved (or was abandoned
    /// by `disconnect`) and the timer is stale.
    pub(crate) fn on_connect_timeout(&self) {
        let mut state = self.state.write();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Timeout;
            let err = FeedError::ChannelTimeout(self.connect_timeout_secs);
            *self.diagnostic.write() = Some(err.to_string());
            warn!(timeout_secs = self.connect_timeout_secs, "stream connect timed out");
        }
    }

    /// Attach the control-message sink of a live transport.
    pub(crate) fn attach_outbound(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.outbound.write() = Some(tx);
    }

    /// Decode an inbound text frame and fan out updates for subscribed
    /// symbols. Only meaningful while connected; malformed payloads are
    /// dropped silently.
    pub(crate) fn handle_message(&self, text: &str) {
        if self.state() != ChannelState::Connected {
            return;
        }
        match decode_trades(text) {
            Ok(trades) => {
                let subs = self.subscriptions.read();
                for update in trades {
                    if subs.contains(&update.symbol) {
                        // Nobody listening is fine.
                        let _ = self.updates.send(update);
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed stream message");
            }
        }
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// Decode a trade payload into updates. Non-trade message types (pings,
/// acknowledgements) yield an empty list; a payload that does not match the
/// expected envelope at all is a `MalformedMessage`.
///
/// Entries inside a well-formed envelope that are missing fields are skipped
/// individually rather than failing the whole batch.
fn decode_trades(text: &str) -> Result<Vec<TradeUpdate>, FeedError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FeedError::MalformedMessage(e.to_string()))?;

    let kind = root["type"]
        .as_str()
        .ok_or_else(|| FeedError::MalformedMessage("missing field: type".into()))?;

    if kind != "trade" {
        return Ok(Vec::new());
    }

    let data = root["data"]
        .as_array()
        .ok_or_else(|| FeedError::MalformedMessage("trade payload missing data array".into()))?;

    let mut updates = Vec::with_capacity(data.len());
    for entry in data {
        let Some(symbol) = entry["s"].as_str() else {
            debug!("trade entry missing symbol, skipping");
            continue;
        };
        let price = crate::rest::coerce_value(&entry["p"]);
        let Some(millis) = entry["t"].as_i64() else {
            debug!(symbol, "trade entry missing timestamp, skipping");
            continue;
        };
        updates.push(TradeUpdate {
            symbol: symbol.to_string(),
            point: Point::new(millis / 1000, price),
        });
    }

    Ok(updates)
}

// ---------------------------------------------------------------------------
// Transport driver
// ---------------------------------------------------------------------------

/// Drive one connection attempt for `channel`: connect (bounded by the
/// connect timeout), then pump inbound frames and outbound control messages
/// until the connection ends. Returns when the transport is gone; the channel
/// state tells the caller why.
pub async fn run_stream(channel: Arc<StreamChannel>) {
    if !channel.begin_connect() {
        warn!(state = %channel.state(), "connect ignored: channel already active");
        return;
    }

    info!(url = %channel.url, "connecting to stream");

    let timeout = Duration::from_secs(channel.connect_timeout_secs);
    let ws_stream = match tokio::time::timeout(timeout, connect_async(&channel.url)).await {
        // Dropping the connect future tears down the half-open transport.
        Err(_) => {
            channel.on_connect_timeout();
            return;
        }
        Ok(Err(e)) => {
            channel.on_error(&format!("connect failed: {e}"));
            return;
        }
        Ok(Ok((ws, _response))) => ws,
    };

    // disconnect() may have landed while the handshake was in flight. The
    // channel is no longer waiting for this attempt, so the fresh transport
    // is closed instead of adopted.
    if channel.state() != ChannelState::Connecting {
        debug!(state = %channel.state(), "connect abandoned, closing transport");
        let mut ws_stream = ws_stream;
        let _ = ws_stream.close(None).await;
        return;
    }

    channel.on_open();

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    channel.attach_outbound(tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        channel.on_error(&format!("write failed: {e}"));
                        break;
                    }
                }
                // Sender dropped by disconnect(); close politely.
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => channel.handle_message(&text),
                Some(Ok(Message::Close(frame))) => {
                    let (normal, reason) = match frame {
                        Some(f) => (
                            f.code == CloseCode::Normal,
                            if f.reason.is_empty() { None } else { Some(f.reason.to_string()) },
                        ),
                        None => (true, None),
                    };
                    channel.on_close(normal, reason);
                    break;
                }
                // Ping/Pong handled by tungstenite, Binary not part of the feed.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    channel.on_error(&format!("read failed: {e}"));
                    break;
                }
                None => {
                    channel.on_close(false, Some("stream ended".to_string()));
                    break;
                }
            }
        }
    }

    *channel.outbound.write() = None;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_json(symbol: &str, price: f64, millis: i64) -> String {
        serde_json::json!({
            "type": "trade",
            "data": [{ "s": symbol, "p": price, "t": millis }]
        })
        .to_string()
    }

    #[test]
    fn decode_trade_payload() {
        let updates = decode_trades(&trade_json("BINANCE:BTCUSDT", 42000.5, 1_700_000_000_123)).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].symbol, "BINANCE:BTCUSDT");
        assert_eq!(updates[0].point.time, 1_700_000_000);
        assert_eq!(updates[0].point.value, 42000.5);
    }

    #[test]
    fn decode_ignores_non_trade_types() {
        let updates = decode_trades(r#"{"type":"ping"}"#).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn decode_rejects_malformed_envelope() {
        assert!(matches!(
            decode_trades("not json"),
            Err(FeedError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_trades(r#"{"data":[]}"#),
            Err(FeedError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_trades(r#"{"type":"trade","data":"nope"}"#),
            Err(FeedError::MalformedMessage(_))
        ));
    }

    #[test]
    fn decode_skips_incomplete_entries() {
        let text = serde_json::json!({
            "type": "trade",
            "data": [
                { "p": 1.0, "t": 1000 },
                { "s": "BTCUSDT", "p": 2.0, "t": 2000 },
                { "s": "ETHUSDT", "p": 3.0 }
            ]
        })
        .to_string();
        let updates = decode_trades(&text).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].symbol, "BTCUSDT");
    }

    #[test]
    fn connect_then_open_yields_connected() {
        let ch = StreamChannel::new("ws://example", 5);
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert!(ch.begin_connect());
        assert_eq!(ch.state(), ChannelState::Connecting);
        ch.on_open();
        assert_eq!(ch.state(), ChannelState::Connected);
        assert!(ch.diagnostic().is_none());
    }

    #[test]
    fn double_connect_is_rejected() {
        let ch = StreamChannel::new("ws://example", 5);
        assert!(ch.begin_connect());
        assert!(!ch.begin_connect());
        ch.on_open();
        assert!(!ch.begin_connect());
    }

    #[test]
    fn timeout_before_open() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.on_connect_timeout();
        assert_eq!(ch.state(), ChannelState::Timeout);
        assert!(ch.diagnostic().unwrap().contains("timed out"));
    }

    #[test]
    fn timeout_after_open_is_ignored() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.on_open();
        ch.on_connect_timeout();
        assert_eq!(ch.state(), ChannelState::Connected);
    }

    #[test]
    fn stale_timeout_after_disconnect_is_ignored() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.disconnect();
        ch.on_connect_timeout();
        assert_eq!(ch.state(), ChannelState::Disconnected);
    }

    #[test]
    fn error_preserves_message_and_open_clears_it() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.on_error("boom");
        assert_eq!(ch.state(), ChannelState::Error);
        assert_eq!(ch.diagnostic().as_deref(), Some("boom"));

        ch.begin_connect();
        ch.on_open();
        assert!(ch.diagnostic().is_none());
    }

    #[test]
    fn abnormal_close_clears_subscriptions_and_keeps_reason() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.on_open();
        let (tx, _rx) = mpsc::unbounded_channel();
        ch.attach_outbound(tx);
        ch.subscribe("BTCUSDT");
        assert_eq!(ch.subscriptions().len(), 1);

        ch.on_close(false, Some("going away".into()));
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert!(ch.subscriptions().is_empty());
        assert_eq!(ch.diagnostic().as_deref(), Some("going away"));
    }

    #[test]
    fn subscribe_is_noop_when_not_connected() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.subscribe("BTCUSDT");
        assert!(ch.subscriptions().is_empty());

        ch.begin_connect();
        ch.subscribe("BTCUSDT");
        assert!(ch.subscriptions().is_empty());
    }

    #[test]
    fn subscribe_sends_control_message_when_connected() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.on_open();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.attach_outbound(tx);

        ch.subscribe("BTCUSDT");
        ch.subscribe("BTCUSDT"); // set semantics: still one entry
        assert_eq!(ch.subscriptions().len(), 1);

        let Message::Text(payload) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["symbol"], "BTCUSDT");

        ch.unsubscribe("BTCUSDT");
        assert!(ch.subscriptions().is_empty());
    }

    #[test]
    fn handle_message_broadcasts_only_subscribed_symbols() {
        let ch = StreamChannel::new("ws://example", 5);
        ch.begin_connect();
        ch.on_open();
        let (tx, _outbound) = mpsc::unbounded_channel();
        ch.attach_outbound(tx);
        ch.subscribe("BTCUSDT");

        let mut rx = ch.subscribe_updates();
        ch.handle_message(&trade_json("BTCUSDT", 100.0, 5_000));
        ch.handle_message(&trade_json("ETHUSDT", 200.0, 6_000));

        let update = rx.try_recv().unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_message_ignored_unless_connected() {
        let ch = StreamChannel::new("ws://example", 5);
        let mut rx = ch.subscribe_updates();
        ch.handle_message(&trade_json("BTCUSDT", 100.0, 5_000));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_timeout_forcibly_closes() {
        // A listener that accepts but never completes the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let ch = Arc::new(StreamChannel::new(format!("ws://{addr}"), 1));
        run_stream(ch.clone()).await;
        assert_eq!(ch.state(), ChannelState::Timeout);
    }

    #[tokio::test]
    async fn disconnect_while_connecting_discards_the_transport() {
        // A handshake gated on the test, leaving the channel parked in
        // Connecting for as long as we want.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = release_rx.await;
            let _ = tokio_tungstenite::accept_async(socket).await;
        });

        let ch = Arc::new(StreamChannel::new(format!("ws://{addr}"), 5));
        let driver = tokio::spawn(run_stream(ch.clone()));
        while ch.state() != ChannelState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        ch.disconnect();
        assert_eq!(ch.state(), ChannelState::Disconnected);

        // The late handshake must not resurrect the channel or leave the
        // driver pumping a transport nobody owns.
        let _ = release_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("transport driver did not exit")
            .unwrap();
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert!(ch.outbound.read().is_none());
        assert!(ch.begin_connect());
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ch = Arc::new(StreamChannel::new(format!("ws://{addr}"), 5));
        run_stream(ch.clone()).await;
        assert_eq!(ch.state(), ChannelState::Error);
        assert!(ch.diagnostic().is_some());
    }
}
