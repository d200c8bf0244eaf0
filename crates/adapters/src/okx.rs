//! OKX v5 public adapter.
//!
//! OKX addresses instruments by dashed instId (`BTC-USDT`); the canonical
//! symbol is the compact form, and this adapter owns the mapping in both
//! directions. The `books` channel pushes a seqId'd snapshot right after
//! subscribe, which the ingestor uses as its synchronization point.

use crate::{parse_side, AdapterError, ExchangeAdapter, Feed, Result};
use async_trait::async_trait;
use common::now_ms;
use common::schema::{
    BookDelta, BookSnapshot, CanonicalEvent, Exchange, Kline, Level, OpenInterest, Trade,
};
use rust_decimal::Decimal;
use serde::Deserialize;

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_BOOKS: &str = "https://www.okx.com/api/v5/market/books";

#[derive(Debug, Clone, Default)]
pub struct OkxAdapter;

/// `BTCUSDT` -> `BTC-USDT`. Symbols already dashed pass through.
pub fn inst_id(symbol: &str) -> String {
    if symbol.contains('-') {
        return symbol.to_string();
    }
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}");
            }
        }
    }
    symbol.to_string()
}

/// `BTC-USDT` -> `BTCUSDT`.
pub fn canonical_symbol(inst_id: &str) -> String {
    inst_id.replace('-', "")
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    event: Option<String>,
    arg: Option<Arg>,
    action: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Arg {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    bids: Vec<Vec<Decimal>>,
    asks: Vec<Vec<Decimal>>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId")]
    prev_seq_id: i64,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "tradeId")]
    trade_id: String,
    px: Decimal,
    sz: Decimal,
    side: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct OpenInterestData {
    oi: Decimal,
    #[serde(rename = "oiUsd")]
    oi_usd: Option<Decimal>,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct RestBooksResponse {
    code: String,
    msg: Option<String>,
    data: Vec<RestBookData>,
}

#[derive(Debug, Deserialize)]
struct RestBookData {
    bids: Vec<Vec<Decimal>>,
    asks: Vec<Vec<Decimal>>,
    ts: String,
}

/// OKX levels are `[price, size, liquidated, orders]`; only the first two
/// matter here.
fn levels(rows: &[Vec<Decimal>]) -> Result<Vec<Level>> {
    rows.iter()
        .map(|row| {
            if row.len() < 2 {
                return Err(AdapterError::Protocol("short book level".to_string()));
            }
            Ok(Level::new(row[0], row[1]))
        })
        .collect()
}

fn parse_ts(raw: &str) -> i64 {
    raw.parse().unwrap_or_else(|_| now_ms())
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| AdapterError::Protocol(e.to_string()))
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn ws_url(&self, _symbol: &str, _feeds: &[Feed]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, symbol: &str, feeds: &[Feed]) -> Vec<String> {
        let inst = inst_id(symbol);
        let args: Vec<serde_json::Value> = feeds
            .iter()
            .filter_map(|feed| match feed {
                Feed::OrderBook => Some(serde_json::json!({"channel": "books", "instId": inst})),
                Feed::Trades => Some(serde_json::json!({"channel": "trades", "instId": inst})),
                Feed::Kline => Some(serde_json::json!({"channel": "candle1m", "instId": inst})),
                Feed::OpenInterest => {
                    Some(serde_json::json!({"channel": "open-interest", "instId": inst}))
                }
                // No per-instrument public liquidation channel.
                Feed::Liquidations => None,
            })
            .collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn heartbeat_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn parse(&self, symbol: &str, raw: &str) -> Result<Vec<CanonicalEvent>> {
        if raw == "pong" {
            return Ok(vec![]);
        }
        let msg: WsMessage =
            serde_json::from_str(raw).map_err(|e| AdapterError::Protocol(e.to_string()))?;

        // Subscribe acks and error events carry no data.
        if msg.event.is_some() {
            return Ok(vec![]);
        }
        let (arg, data) = match (msg.arg, msg.data) {
            (Some(arg), Some(data)) => (arg, data),
            _ => return Ok(vec![]),
        };

        match arg.channel.as_str() {
            "books" => {
                let books: Vec<BookData> = decode(data)?;
                let snapshot = msg.action.as_deref() == Some("snapshot");
                books
                    .into_iter()
                    .map(|book| {
                        let bids = levels(&book.bids)?;
                        let asks = levels(&book.asks)?;
                        let ts = parse_ts(&book.ts);
                        if snapshot {
                            Ok(CanonicalEvent::Snapshot(BookSnapshot {
                                exchange: Exchange::Okx,
                                symbol: symbol.to_string(),
                                ts,
                                update_id: book.seq_id.max(0) as u64,
                                bids,
                                asks,
                            }))
                        } else {
                            Ok(CanonicalEvent::Delta(BookDelta {
                                exchange: Exchange::Okx,
                                symbol: symbol.to_string(),
                                ts,
                                update_id: book.seq_id.max(0) as u64,
                                prev_update_id: (book.prev_seq_id >= 0)
                                    .then_some(book.prev_seq_id as u64),
                                first_update_id: None,
                                bids,
                                asks,
                            }))
                        }
                    })
                    .collect()
            }
            "trades" => {
                let trades: Vec<TradeData> = decode(data)?;
                trades
                    .into_iter()
                    .filter(|t| t.sz > Decimal::ZERO)
                    .map(|t| {
                        Ok(CanonicalEvent::Trade(Trade {
                            exchange: Exchange::Okx,
                            symbol: symbol.to_string(),
                            ts: parse_ts(&t.ts),
                            trade_id: t.trade_id,
                            side: parse_side(&t.side)?,
                            price: t.px,
                            size: t.sz,
                        }))
                    })
                    .collect()
            }
            "candle1m" => {
                // Candle rows: [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm].
                let rows: Vec<Vec<String>> = decode(data)?;
                rows.into_iter()
                    .map(|row| {
                        if row.len() < 6 {
                            return Err(AdapterError::Protocol("short candle row".to_string()));
                        }
                        let start = parse_ts(&row[0]);
                        let parse_dec = |s: &str| {
                            s.parse::<Decimal>()
                                .map_err(|e| AdapterError::Protocol(e.to_string()))
                        };
                        Ok(CanonicalEvent::Kline(Kline {
                            exchange: Exchange::Okx,
                            symbol: symbol.to_string(),
                            interval: "1".to_string(),
                            start,
                            end: start + 60_000,
                            open: parse_dec(&row[1])?,
                            high: parse_dec(&row[2])?,
                            low: parse_dec(&row[3])?,
                            close: parse_dec(&row[4])?,
                            volume: parse_dec(&row[5])?,
                            confirm: row.get(8).map(|c| c.as_str() == "1").unwrap_or(false),
                        }))
                    })
                    .collect()
            }
            "open-interest" => {
                let points: Vec<OpenInterestData> = decode(data)?;
                Ok(points
                    .into_iter()
                    .map(|p| {
                        CanonicalEvent::OpenInterest(OpenInterest {
                            exchange: Exchange::Okx,
                            symbol: symbol.to_string(),
                            ts: parse_ts(&p.ts),
                            open_interest: p.oi,
                            open_interest_value: p.oi_usd,
                        })
                    })
                    .collect())
            }
            _ => Ok(vec![]),
        }
    }

    async fn fetch_snapshot(
        &self,
        http: &reqwest::Client,
        symbol: &str,
        depth: usize,
    ) -> Result<BookSnapshot> {
        let response: RestBooksResponse = http
            .get(REST_BOOKS)
            .query(&[("instId", inst_id(symbol).as_str()), ("sz", &depth.to_string())])
            .send()
            .await?
            .json()
            .await?;

        if response.code != "0" {
            return Err(AdapterError::Snapshot(
                response.msg.unwrap_or_else(|| "non-zero code".to_string()),
            ));
        }
        let book = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Snapshot("empty books response".to_string()))?;

        Ok(BookSnapshot {
            exchange: Exchange::Okx,
            symbol: symbol.to_string(),
            ts: parse_ts(&book.ts),
            // The REST book carries no seqId; the ingestor treats zero as
            // "no sequence" and re-anchors on the first live delta.
            update_id: 0,
            bids: levels(&book.bids)?,
            asks: levels(&book.asks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::Side;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(inst_id("BTCUSDT"), "BTC-USDT");
        assert_eq!(inst_id("BTC-USDT"), "BTC-USDT");
        assert_eq!(canonical_symbol("BTC-USDT"), "BTCUSDT");
    }

    #[test]
    fn test_parse_books_snapshot_then_update() {
        let snap = r#"{
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "snapshot",
            "data": [{
                "asks": [["8476.98", "415", "0", "13"]],
                "bids": [["8476.97", "256", "0", "12"]],
                "ts": "1597026383085",
                "seqId": 123456,
                "prevSeqId": -1,
                "checksum": -855196043
            }]
        }"#;
        let events = OkxAdapter.parse("BTCUSDT", snap).unwrap();
        match &events[0] {
            CanonicalEvent::Snapshot(s) => {
                assert_eq!(s.update_id, 123456);
                assert_eq!(s.asks[0], Level::new(dec("8476.98"), dec("415")));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        let update = r#"{
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "update",
            "data": [{
                "asks": [["8476.98", "0", "0", "0"]],
                "bids": [],
                "ts": "1597026383090",
                "seqId": 123457,
                "prevSeqId": 123456,
                "checksum": -855196043
            }]
        }"#;
        let events = OkxAdapter.parse("BTCUSDT", update).unwrap();
        match &events[0] {
            CanonicalEvent::Delta(d) => {
                assert_eq!(d.update_id, 123457);
                assert_eq!(d.prev_update_id, Some(123456));
                assert!(d.asks[0].size.is_zero());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "arg": {"channel": "trades", "instId": "BTC-USDT"},
            "data": [{
                "instId": "BTC-USDT",
                "tradeId": "130639474",
                "px": "42219.9",
                "sz": "0.12060306",
                "side": "buy",
                "ts": "1630048897897"
            }]
        }"#;
        let events = OkxAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Trade(t) => {
                assert_eq!(t.side, Side::Buy);
                assert_eq!(t.ts, 1630048897897);
                assert_eq!(t.trade_id, "130639474");
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_candle_confirm_flag() {
        let raw = r#"{
            "arg": {"channel": "candle1m", "instId": "BTC-USDT"},
            "data": [["1629993600000","42500","42800","42100","42700","24","1","1","1"]]
        }"#;
        let events = OkxAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Kline(k) => {
                assert!(k.confirm);
                assert_eq!(k.end - k.start, 60_000);
                assert_eq!(k.low, dec("42100"));
            }
            other => panic!("expected kline, got {other:?}"),
        }
    }

    #[test]
    fn test_pong_and_event_frames_ignored() {
        assert!(OkxAdapter.parse("BTCUSDT", "pong").unwrap().is_empty());
        let ack = r#"{"event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"}}"#;
        assert!(OkxAdapter.parse("BTCUSDT", ack).unwrap().is_empty());
    }
}
