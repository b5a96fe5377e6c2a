// =============================================================================
// RealtimeSession — binds one instrument/currency selection to one live series
// =============================================================================
//
// A session owns exactly one SeriesBuffer and one active data source: either
// the shared stream channel (when connected) or its own fallback poller. Any
// change to the selection tears the session down and starts a fresh one — a
// descriptor is never mutated in place, so late-arriving data for the previous
// configuration can never land in the new buffer.
//
// The stream channel is the only state shared between sessions; a session
// subscribes and unsubscribes only its own symbols.
// =============================================================================

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::convert::ConversionPipeline;
use crate::error::FeedError;
use crate::poller::FallbackPoller;
use crate::rest::{Market, RestFetcher};
use crate::series::{Point, SeriesBuffer};
use crate::stream::{ChannelState, StreamChannel};

/// How the session sources its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One seed fetch for a specific date, then static.
    Historical { date: NaiveDate },
    /// Live updates via stream or polling fallback.
    Realtime,
}

/// Textual status for the rendering collaborator. `NoData` means the session
/// has no data source bound and nothing seeded; a historical session with a
/// seeded buffer reports `Historical` so the renderer never labels a drawn
/// chart "no data".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Streaming,
    Polling,
    Historical,
    NoData,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Polling => write!(f, "polling"),
            Self::Historical => write!(f, "historical"),
            Self::NoData => write!(f, "no data"),
        }
    }
}

/// The instrument/currency/mode tuple a session is bound to. Created once,
/// replaced wholesale on any change.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub market: Market,
    pub instrument: String,
    pub reference_currency: String,
    pub target_currency: String,
    pub mode: SessionMode,
}

impl SessionDescriptor {
    pub fn new(
        market: Market,
        instrument: &str,
        reference_currency: &str,
        target_currency: &str,
        mode: SessionMode,
    ) -> Self {
        Self {
            market,
            instrument: instrument.trim().to_uppercase(),
            reference_currency: reference_currency.trim().to_uppercase(),
            target_currency: target_currency.trim().to_uppercase(),
            mode,
        }
    }

    /// A cross-rate selection prices the instrument in a currency its feed
    /// does not natively provide.
    pub fn is_cross_rate(&self) -> bool {
        self.target_currency != self.reference_currency
    }

    /// Stream symbols this session subscribes: the instrument's trade feed
    /// plus, for cross-rates, the currency-pair feed.
    pub fn stream_symbols(&self) -> Vec<String> {
        let mut symbols = match self.market {
            Market::Crypto => vec![format!("BINANCE:{}USDT", self.instrument)],
            Market::Forex => vec![format!(
                "OANDA:{}_{}",
                self.reference_currency, self.instrument
            )],
        };
        if self.is_cross_rate() {
            symbols.push(format!(
                "OANDA:{}_{}",
                self.reference_currency, self.target_currency
            ));
        }
        symbols
    }
}

/// Best-effort routing of a streamed symbol to a session: case-insensitive
/// substring containment against the instrument and, for cross-rates, the
/// currency pair. Inherited policy; exact symbol equality remains an open
/// product decision.
pub(crate) fn symbol_matches(symbol: &str, descriptor: &SessionDescriptor) -> bool {
    let symbol = symbol.to_uppercase();
    if symbol.contains(&descriptor.instrument) {
        return true;
    }
    descriptor.is_cross_rate()
        && symbol.contains(&descriptor.reference_currency)
        && symbol.contains(&descriptor.target_currency)
}

// ---------------------------------------------------------------------------
// Session core — the state both source tasks write into
// ---------------------------------------------------------------------------

struct SessionCore {
    buffer: SeriesBuffer,
    status: RwLock<SessionStatus>,
    notify: watch::Sender<u64>,
}

impl SessionCore {
    fn new(max_points: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            buffer: SeriesBuffer::new(max_points),
            status: RwLock::new(SessionStatus::NoData),
            notify,
        }
    }

    /// Append one point and wake the renderer.
    fn ingest(&self, point: Point) {
        self.buffer.append(point);
        self.notify.send_modify(|version| *version += 1);
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
        self.notify.send_modify(|version| *version += 1);
    }
}

// ---------------------------------------------------------------------------
// RealtimeSession
// ---------------------------------------------------------------------------

pub struct RealtimeSession {
    descriptor: SessionDescriptor,
    channel: Arc<StreamChannel>,
    core: Arc<SessionCore>,
    poller: FallbackPoller,
    listener: Mutex<Option<JoinHandle<()>>>,
    subscribed: Mutex<Vec<String>>,
}

impl RealtimeSession {
    /// Create the session's buffer and bind its data source.
    ///
    /// Historical mode seeds the buffer once and leaves the session static.
    /// Realtime mode issues one immediate fetch regardless of channel state
    /// (the buffer must be non-empty before the first tick or push when data
    /// exists), then either subscribes the stream or starts the poller.
    pub async fn start(
        descriptor: SessionDescriptor,
        fetcher: Arc<RestFetcher>,
        channel: Arc<StreamChannel>,
        max_points: usize,
        poll_interval_ms: u64,
    ) -> Self {
        let core = Arc::new(SessionCore::new(max_points));
        let session = Self {
            descriptor: descriptor.clone(),
            channel: channel.clone(),
            core: core.clone(),
            poller: FallbackPoller::new(),
            listener: Mutex::new(None),
            subscribed: Mutex::new(Vec::new()),
        };

        match descriptor.mode {
            SessionMode::Historical { date } => {
                session.seed_historical(&fetcher, date).await;
            }
            SessionMode::Realtime => {
                let pipeline = Arc::new(ConversionPipeline::new(fetcher.clone()));

                if let Err(e) = fetch_once(&descriptor, &fetcher, &pipeline, &core).await {
                    warn!(error = %e, instrument = %descriptor.instrument, "initial fetch failed");
                }

                if channel.state() == ChannelState::Connected {
                    session.attach_stream();
                } else {
                    debug!(
                        channel_state = %channel.state(),
                        "stream not usable, falling back to polling"
                    );
                    session.attach_poller(fetcher, pipeline, poll_interval_ms);
                }
            }
        }

        info!(
            instrument = %session.descriptor.instrument,
            target = %session.descriptor.target_currency,
            status = %session.status(),
            "session started"
        );
        session
    }

    /// Current ordered snapshot for the renderer.
    pub fn snapshot(&self) -> Vec<Point> {
        self.core.buffer.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        *self.core.status.read()
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Change notification: the value bumps on every buffer or status
    /// mutation; renderers re-read the snapshot on each change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.core.notify.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// Tear the session down: unsubscribe its symbols, cancel its poller and
    /// stream listener. The buffer dies with the session.
    pub fn stop(&self) {
        for symbol in self.subscribed.lock().drain(..) {
            self.channel.unsubscribe(&symbol);
        }
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        self.poller.stop();
        self.core.set_status(SessionStatus::NoData);
        info!(instrument = %self.descriptor.instrument, "session stopped");
    }

    // -------------------------------------------------------------------------
    // Source binding
    // -------------------------------------------------------------------------

    async fn seed_historical(&self, fetcher: &Arc<RestFetcher>, date: NaiveDate) {
        let d = &self.descriptor;
        match fetcher
            .fetch_historical(d.market, &d.instrument, &d.reference_currency, date)
            .await
        {
            Ok(points) => {
                if let Some(point) = points.get(&d.instrument) {
                    self.core.ingest(*point);
                    self.core.set_status(SessionStatus::Historical);
                } else {
                    warn!(instrument = %d.instrument, %date, "no historical point for instrument");
                }
            }
            Err(e) => warn!(error = %e, %date, "historical fetch failed"),
        }
    }

    fn attach_stream(&self) {
        let symbols = self.descriptor.stream_symbols();
        for symbol in &symbols {
            self.channel.subscribe(symbol);
        }
        *self.subscribed.lock() = symbols;

        let mut updates = self.channel.subscribe_updates();
        let core = self.core.clone();
        let descriptor = self.descriptor.clone();
        let task = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        if symbol_matches(&update.symbol, &descriptor) {
                            core.ingest(update.point);
                        }
                    }
                    // Last-value feed: skipping lagged updates is fine.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "stream listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock() = Some(task);

        self.core.set_status(SessionStatus::Streaming);
    }

    fn attach_poller(
        &self,
        fetcher: Arc<RestFetcher>,
        pipeline: Arc<ConversionPipeline>,
        poll_interval_ms: u64,
    ) {
        let descriptor = self.descriptor.clone();
        let core = self.core.clone();

        if descriptor.is_cross_rate() {
            self.poller.start(poll_interval_ms, move || {
                let pipeline = pipeline.clone();
                let core = core.clone();
                let d = descriptor.clone();
                async move {
                    let point = pipeline
                        .derive_price(
                            d.market,
                            &d.instrument,
                            &d.reference_currency,
                            &d.target_currency,
                        )
                        .await?;
                    core.ingest(point);
                    Ok(())
                }
            });
        } else {
            self.poller.start(poll_interval_ms, move || {
                let fetcher = fetcher.clone();
                let core = core.clone();
                let d = descriptor.clone();
                async move {
                    let points = fetcher
                        .fetch_latest(d.market, &d.instrument, &d.reference_currency)
                        .await?;
                    match points.get(&d.instrument) {
                        Some(point) => {
                            core.ingest(*point);
                            Ok(())
                        }
                        None => Err(FeedError::fetch_other(format!(
                            "no quote for {} in latest response",
                            d.instrument
                        ))),
                    }
                }
            });
        }

        self.core.set_status(SessionStatus::Polling);
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One immediate fetch on session start, via the pipeline for cross-rates.
async fn fetch_once(
    descriptor: &SessionDescriptor,
    fetcher: &Arc<RestFetcher>,
    pipeline: &Arc<ConversionPipeline>,
    core: &Arc<SessionCore>,
) -> Result<(), FeedError> {
    if descriptor.is_cross_rate() {
        let point = pipeline
            .derive_price(
                descriptor.market,
                &descriptor.instrument,
                &descriptor.reference_currency,
                &descriptor.target_currency,
            )
            .await?;
        core.ingest(point);
        return Ok(());
    }

    let points = fetcher
        .fetch_latest(
            descriptor.market,
            &descriptor.instrument,
            &descriptor.reference_currency,
        )
        .await?;
    match points.get(&descriptor.instrument) {
        Some(point) => {
            core.ingest(*point);
            Ok(())
        }
        None => Err(FeedError::fetch_other(format!(
            "no quote for {} in latest response",
            descriptor.instrument
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
