// =============================================================================
// Feed error taxonomy
// =============================================================================
//
// Every failure a data source can produce maps onto one of these variants.
// Policy: errors are caught at the boundary closest to their origin and folded
// into session status/diagnostic text — a feed failure never kills the process.
// =============================================================================

use thiserror::Error;

/// Errors produced by the REST fetcher, the conversion pipeline, and the
/// streaming channel.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network failure or non-2xx response on a REST call. No internal retry;
    /// retry policy belongs to the caller (poller tick or session start).
    #[error("fetch failed: {context}")]
    Fetch {
        context: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The conversion step of a cross-rate derivation failed. Recovered by
    /// the pipeline (unconverted reference price is used), never propagated.
    #[error("conversion unavailable: {0}")]
    ConversionUnavailable(String),

    /// Transport-level stream failure. Recovered by falling back to polling.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The stream connection did not open within the connect timeout.
    #[error("channel connect timed out after {0}s")]
    ChannelTimeout(u64),

    /// Unexpected streaming payload shape. Dropped silently at the decode
    /// boundary; does not affect the buffer or the session status.
    #[error("malformed stream message: {0}")]
    MalformedMessage(String),
}

impl FeedError {
    /// Wrap a reqwest error with request context.
    pub fn fetch(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Fetch {
            context: context.into(),
            source: Some(source),
        }
    }

    /// A fetch-level failure with no underlying transport error (e.g. a
    /// non-2xx status or a missing symbol in the response).
    pub fn fetch_other(context: impl Into<String>) -> Self {
        Self::Fetch {
            context: context.into(),
            source: None,
        }
    }
}
