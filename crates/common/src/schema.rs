//! Canonical event model shared by every service.
//!
//! All venues are normalized into these types exactly once, inside the
//! exchange adapters. Timestamps are milliseconds since the Unix epoch,
//! sides are lowercase `buy`/`sell`, prices and sizes are decimals
//! (strings on the wire).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bybit,
    Binance,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Bybit => "bybit",
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
        }
    }

    pub const ALL: [Exchange; 3] = [Exchange::Bybit, Exchange::Binance, Exchange::Okx];
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bybit" => Ok(Exchange::Bybit),
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// Contract class of an instrument. Only linear perpetuals are ingested
/// today; the field exists so the partition key stays stable if that
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractClass {
    #[default]
    LinearPerpetual,
    Spot,
}

/// Partition key used everywhere: one instrument on one venue.
///
/// The canonical symbol is the compact uppercase form (`BTCUSDT`); the OKX
/// adapter owns the mapping to its dashed instId.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub symbol: String,
    #[serde(default)]
    pub class: ContractClass,
}

impl Instrument {
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            class: ContractClass::LinearPerpetual,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Aggressor side of a trade, or the book side of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The book side a trade with this aggressor side consumes: a buy
    /// aggressor lifts asks, a sell aggressor hits bids.
    pub fn consumes(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// One price level. A size of zero in a delta means the level is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

impl Level {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Full book at a known update id; the synchronization point for deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    /// Venue sequence id the snapshot is valid at (`last_update_id`).
    /// Zero means the venue's REST book carries no sequence id.
    pub update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Incremental book update. Venue sequence ids are surfaced untouched for
/// the ingestor to validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub update_id: u64,
    /// Final update id of the previous delta, when the venue provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_update_id: Option<u64>,
    /// First update id covered by this delta, when the venue provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_update_id: Option<u64>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// A single public trade. `trade_id` is unique within (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub trade_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// One candle. Non-confirmed candles may be overwritten by later updates
/// sharing `start`; confirmed candles are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: String,
    pub start: i64,
    pub end: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub confirm: bool,
}

/// Open interest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub open_interest: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest_value: Option<Decimal>,
}

/// A forced liquidation. `side` is the side of the liquidated position's
/// closing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Event emitted by an exchange adapter. The ingestor's state machine
/// consumes `Snapshot`/`Delta`; everything else passes straight through to
/// its stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    Trade(Trade),
    Kline(Kline),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
}

/// Authoritative top-N view of a book, appended to `dom:{ex}:{sym}` after
/// every successful apply and cached in KV for gateway bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// One row of a heatmap slice: aggregated book volume in a price bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapRow {
    pub price_bin: Decimal,
    pub vol_bid: Decimal,
    pub vol_ask: Decimal,
}

/// Aggregated DOM volumes binned by price at slice time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSlice {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub rows: Vec<HeatmapRow>,
}

/// One price level of a footprint bar. `delta = vol_ask - vol_bid` where
/// buy aggressors count into `vol_ask` and sell aggressors into `vol_bid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintLevel {
    pub price: Decimal,
    pub vol_bid: Decimal,
    pub vol_ask: Decimal,
    pub delta: Decimal,
}

/// A level where one side dominates the other by the configured ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceLevel {
    pub price: Decimal,
    pub side: Side,
    pub ratio: Decimal,
}

/// Closed footprint bar. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintBar {
    pub exchange: Exchange,
    pub symbol: String,
    pub start: i64,
    pub end: i64,
    pub levels: Vec<FootprintLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc_price: Option<Decimal>,
    pub imbalance_levels: Vec<ImbalanceLevel>,
}

/// Detection event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Iceberg,
    Wall,
    Spoof,
}

/// Detection event (iceberg / wall / spoof). Created on detection, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub side: Side,
    pub price: Decimal,
    pub payload: serde_json::Value,
}

/// Buy/sell volume sums over one tape window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeWindow {
    pub buy_vol: Decimal,
    pub sell_vol: Decimal,
    pub delta: Decimal,
}

/// Rolling tape aggregate, keyed by window label (`1s`, `5s`, `1m`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeAggregate {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub windows: std::collections::BTreeMap<String, TapeWindow>,
    pub last_price: Decimal,
    pub last_size: Decimal,
    pub last_side: Side,
    pub large: bool,
}

/// Continuous trend score point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendScore {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub delta_imbalance: f64,
    pub absorption: f64,
    pub score_impulse: f64,
    pub trend_power: f64,
    pub trend_power_delta: f64,
}

/// Exhaustion / absorption score point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustionScore {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub exhaustion_score: f64,
    pub absorption_score: f64,
}

/// Rule-based reversal signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleReversal {
    pub exchange: Exchange,
    pub symbol: String,
    pub ts: i64,
    pub prob_reversal_rule: f64,
    pub reversal_horizon_bars: u32,
    pub expected_move_range: [Decimal; 2],
}

/// Closed set of record types carried on broker streams and pub/sub
/// channels. The `kind` discriminator makes payloads self-describing;
/// decoding fails fast on unknown kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamRecord {
    Dom(DomSnapshot),
    Trade(Trade),
    Kline(Kline),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
    HeatmapSlice(HeatmapSlice),
    FootprintBar(FootprintBar),
    Event(MarketEvent),
    Tape(TapeAggregate),
    TrendScore(TrendScore),
    ExhaustionScore(ExhaustionScore),
    RuleReversal(RuleReversal),
}

impl StreamRecord {
    /// Event timestamp of the record, used for seam deduplication at the
    /// gateway.
    pub fn ts(&self) -> i64 {
        match self {
            StreamRecord::Dom(d) => d.ts,
            StreamRecord::Trade(t) => t.ts,
            StreamRecord::Kline(k) => k.start,
            StreamRecord::OpenInterest(o) => o.ts,
            StreamRecord::Liquidation(l) => l.ts,
            StreamRecord::HeatmapSlice(h) => h.ts,
            StreamRecord::FootprintBar(f) => f.end,
            StreamRecord::Event(e) => e.ts,
            StreamRecord::Tape(t) => t.ts,
            StreamRecord::TrendScore(s) => s.ts,
            StreamRecord::ExhaustionScore(s) => s.ts,
            StreamRecord::RuleReversal(s) => s.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let record = StreamRecord::Trade(Trade {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts: 1_700_000_000_000,
            trade_id: "t-1".to_string(),
            side: Side::Buy,
            price: dec("16578.50"),
            size: dec("0.001"),
        });

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""kind":"trade""#));
        assert!(json.contains(r#""side":"buy""#));

        let back: StreamRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"kind":"mystery","ts":1}"#;
        assert!(serde_json::from_str::<StreamRecord>(json).is_err());
    }

    #[test]
    fn test_exchange_parse() {
        assert_eq!(Exchange::from_str("BYBIT").unwrap(), Exchange::Bybit);
        assert_eq!(Exchange::Okx.as_str(), "okx");
        assert!(Exchange::from_str("ftx").is_err());
    }

    #[test]
    fn test_side_consumes() {
        assert_eq!(Side::Buy.consumes(), Side::Sell);
        assert_eq!(Side::Sell.consumes(), Side::Buy);
    }

    #[test]
    fn test_event_type_wire_form() {
        let ev = MarketEvent {
            event_type: EventType::Spoof,
            exchange: Exchange::Binance,
            symbol: "ETHUSDT".to_string(),
            ts: 1,
            side: Side::Buy,
            price: dec("99.0"),
            payload: serde_json::json!({"size": "500"}),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"SPOOF""#));
    }
}
