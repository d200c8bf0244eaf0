//! Canonical broker stream, channel and KV key names.
//!
//! Streams and pub/sub channels share the same `{family}:{exchange}:{symbol}`
//! names; KV keys reuse the DOM stream name plus `worker:{name}:hb` and
//! `tape:{ex}:{sym}`.

use crate::schema::{Exchange, Instrument};

pub const DOM_MAXLEN: usize = 10_000;
pub const TRADES_MAXLEN: usize = 10_000;
pub const KLINE_MAXLEN: usize = 5_000;
pub const OI_MAXLEN: usize = 5_000;
pub const LIQ_MAXLEN: usize = 10_000;
/// ~10 minutes of 1 s heatmap slices.
pub const HEATMAP_MAXLEN: usize = 600;
pub const FOOTPRINT_MAXLEN: usize = 5_000;
pub const EVENTS_MAXLEN: usize = 10_000;
pub const SCORES_MAXLEN: usize = 10_000;

/// TTL for the KV DOM snapshot, seconds.
pub const DOM_TTL_SECS: u64 = 60;
/// TTL for worker liveness heartbeats, seconds.
pub const HEARTBEAT_TTL_SECS: u64 = 10;
/// TTL for the tape aggregate KV entry, seconds.
pub const TAPE_TTL_SECS: u64 = 60;

fn keyed(family: &str, exchange: Exchange, symbol: &str) -> String {
    format!("{family}:{exchange}:{symbol}")
}

pub fn dom(exchange: Exchange, symbol: &str) -> String {
    keyed("dom", exchange, symbol)
}

pub fn trades(exchange: Exchange, symbol: &str) -> String {
    keyed("trades", exchange, symbol)
}

pub fn kline(exchange: Exchange, symbol: &str) -> String {
    keyed("kline", exchange, symbol)
}

pub fn oi(exchange: Exchange, symbol: &str) -> String {
    keyed("oi", exchange, symbol)
}

pub fn liq(exchange: Exchange, symbol: &str) -> String {
    keyed("liq", exchange, symbol)
}

pub fn heatmap(exchange: Exchange, symbol: &str) -> String {
    keyed("heatmap", exchange, symbol)
}

pub fn footprint(exchange: Exchange, symbol: &str) -> String {
    keyed("footprint", exchange, symbol)
}

pub fn events(exchange: Exchange, symbol: &str) -> String {
    keyed("events", exchange, symbol)
}

pub fn tape(exchange: Exchange, symbol: &str) -> String {
    keyed("tape", exchange, symbol)
}

pub fn scores_trend(exchange: Exchange, symbol: &str) -> String {
    keyed("scores.trend", exchange, symbol)
}

pub fn scores_exhaustion(exchange: Exchange, symbol: &str) -> String {
    keyed("scores.exhaustion", exchange, symbol)
}

pub fn signals_rule_reversal(exchange: Exchange, symbol: &str) -> String {
    keyed("signals.rule_reversal", exchange, symbol)
}

pub fn ai_response(exchange: Exchange, symbol: &str) -> String {
    keyed("ai_response", exchange, symbol)
}

/// Liveness heartbeat key for a worker task.
pub fn worker_heartbeat(name: &str) -> String {
    format!("worker:{name}:hb")
}

/// Pattern matching every worker heartbeat key.
pub const WORKER_HEARTBEAT_PATTERN: &str = "worker:*:hb";

/// The five raw streams an instrument's ingestor writes.
pub fn raw_streams(instrument: &Instrument) -> Vec<String> {
    let (ex, sym) = (instrument.exchange, instrument.symbol.as_str());
    vec![
        dom(ex, sym),
        trades(ex, sym),
        kline(ex, sym),
        oi(ex, sym),
        liq(ex, sym),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        assert_eq!(dom(Exchange::Bybit, "BTCUSDT"), "dom:bybit:BTCUSDT");
        assert_eq!(
            scores_trend(Exchange::Okx, "ETHUSDT"),
            "scores.trend:okx:ETHUSDT"
        );
        assert_eq!(worker_heartbeat("tape:bybit:BTCUSDT"), "worker:tape:bybit:BTCUSDT:hb");
    }

    #[test]
    fn test_raw_streams_cover_all_feeds() {
        let inst = Instrument::new(Exchange::Binance, "BTCUSDT");
        let names = raw_streams(&inst);
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| n.ends_with(":binance:BTCUSDT")));
    }
}
