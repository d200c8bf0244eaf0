//! Exchange adapters: one per venue, translating wire messages into the
//! canonical event model exactly once.
//!
//! An adapter owns URL construction, subscription framing, heartbeat
//! choice and wire-to-canonical translation. Connection lifecycle
//! (reconnect backoff, resync) belongs to the ingestor.

pub mod binance;
pub mod bybit;
pub mod connection;
pub mod okx;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use connection::VenueConnection;
pub use okx::OkxAdapter;

use async_trait::async_trait;
use common::schema::{BookSnapshot, CanonicalEvent, Exchange, Side};
use thiserror::Error;

/// Market-data feeds an adapter can subscribe to. Not every venue offers
/// every feed; unsupported feeds are ignored by `ws_url`/`subscribe_frames`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    OrderBook,
    Trades,
    Kline,
    OpenInterest,
    Liquidations,
}

impl Feed {
    pub const ALL: [Feed; 5] = [
        Feed::OrderBook,
        Feed::Trades,
        Feed::Kline,
        Feed::OpenInterest,
        Feed::Liquidations,
    ];
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Malformed wire frame. The frame is dropped and counted; the stream
    /// continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket closed or timed out; propagates up to the ingestor.
    #[error("disconnected: {0}")]
    Disconnect(String),

    /// REST transport failure (snapshot fetch).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Venue returned an error body for a snapshot request.
    #[error("snapshot rejected: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// One venue. Implementations are stateless and cheap to clone.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// WebSocket endpoint for a symbol and feed set. Binance encodes the
    /// subscription in the URL; the others use a plain endpoint plus
    /// subscribe frames.
    fn ws_url(&self, symbol: &str, feeds: &[Feed]) -> String;

    /// Frames to send right after the socket opens.
    fn subscribe_frames(&self, symbol: &str, feeds: &[Feed]) -> Vec<String>;

    /// Venue application-level heartbeat frame, if any.
    fn heartbeat_frame(&self) -> Option<String> {
        None
    }

    /// Translate one raw text frame. Control frames (acks, pongs) yield an
    /// empty vector; malformed frames yield `AdapterError::Protocol`.
    fn parse(&self, symbol: &str, raw: &str) -> Result<Vec<CanonicalEvent>>;

    /// Fetch a REST book snapshot at the venue-recommended depth.
    async fn fetch_snapshot(
        &self,
        http: &reqwest::Client,
        symbol: &str,
        depth: usize,
    ) -> Result<BookSnapshot>;
}

/// Normalize a venue side string (`Buy`, `SELL`, `buy`, ...).
pub(crate) fn parse_side(raw: &str) -> Result<Side> {
    match raw.to_ascii_lowercase().as_str() {
        "buy" | "bid" => Ok(Side::Buy),
        "sell" | "ask" => Ok(Side::Sell),
        other => Err(AdapterError::Protocol(format!("unknown side: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_side() {
        assert_eq!(parse_side("Buy").unwrap(), Side::Buy);
        assert_eq!(parse_side("SELL").unwrap(), Side::Sell);
        assert!(parse_side("hold").is_err());
    }
}
