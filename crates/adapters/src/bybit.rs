//! Bybit v5 linear perpetuals adapter.
//!
//! Wire docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/orderbook>

use crate::{parse_side, AdapterError, ExchangeAdapter, Feed, Result};
use async_trait::async_trait;
use common::schema::{
    BookDelta, BookSnapshot, CanonicalEvent, Exchange, Kline, Level, Liquidation, OpenInterest,
    Trade,
};
use common::now_ms;
use rust_decimal::Decimal;
use serde::Deserialize;

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const REST_ORDERBOOK: &str = "https://api.bybit.com/v5/market/orderbook";
const BOOK_DEPTH: usize = 200;
const KLINE_INTERVAL: &str = "1";

#[derive(Debug, Clone, Default)]
pub struct BybitAdapter;

impl BybitAdapter {
    fn topics(&self, symbol: &str, feeds: &[Feed]) -> Vec<String> {
        feeds
            .iter()
            .filter_map(|feed| match feed {
                Feed::OrderBook => Some(format!("orderbook.{BOOK_DEPTH}.{symbol}")),
                Feed::Trades => Some(format!("publicTrade.{symbol}")),
                Feed::Kline => Some(format!("kline.{KLINE_INTERVAL}.{symbol}")),
                Feed::OpenInterest => Some(format!("tickers.{symbol}")),
                Feed::Liquidations => Some(format!("allLiquidation.{symbol}")),
            })
            .collect()
    }
}

/// Envelope for every public-topic message.
#[derive(Debug, Deserialize)]
struct WsMessage {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    ts: Option<i64>,
    data: Option<serde_json::Value>,
    /// Present on op acks (`subscribe`, `pong`).
    op: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(rename = "s")]
    _symbol: String,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "T")]
    ts: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "i")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    start: i64,
    end: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    open_interest: Option<Decimal>,
    open_interest_value: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LiquidationData {
    #[serde(rename = "T")]
    ts: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct RestBookResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: Option<String>,
    result: Option<RestBookResult>,
}

#[derive(Debug, Deserialize)]
struct RestBookResult {
    ts: i64,
    #[serde(rename = "u")]
    update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

fn levels(pairs: Vec<(Decimal, Decimal)>) -> Vec<Level> {
    pairs
        .into_iter()
        .map(|(price, size)| Level::new(price, size))
        .collect()
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| AdapterError::Protocol(e.to_string()))
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn ws_url(&self, _symbol: &str, _feeds: &[Feed]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, symbol: &str, feeds: &[Feed]) -> Vec<String> {
        let args = self.topics(symbol, feeds);
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn heartbeat_frame(&self) -> Option<String> {
        Some(r#"{"op":"ping"}"#.to_string())
    }

    fn parse(&self, symbol: &str, raw: &str) -> Result<Vec<CanonicalEvent>> {
        let msg: WsMessage =
            serde_json::from_str(raw).map_err(|e| AdapterError::Protocol(e.to_string()))?;

        // Op acks and pongs carry no market data.
        if msg.op.is_some() {
            return Ok(vec![]);
        }
        let (topic, data) = match (msg.topic, msg.data) {
            (Some(topic), Some(data)) => (topic, data),
            _ => return Ok(vec![]),
        };
        let ts = msg.ts.unwrap_or_else(now_ms);

        if topic.starts_with("orderbook.") {
            let book: BookData = decode(data)?;
            let bids = levels(book.bids);
            let asks = levels(book.asks);
            let event = if msg.kind.as_deref() == Some("snapshot") {
                CanonicalEvent::Snapshot(BookSnapshot {
                    exchange: Exchange::Bybit,
                    symbol: symbol.to_string(),
                    ts,
                    update_id: book.update_id,
                    bids,
                    asks,
                })
            } else {
                CanonicalEvent::Delta(BookDelta {
                    exchange: Exchange::Bybit,
                    symbol: symbol.to_string(),
                    ts,
                    update_id: book.update_id,
                    // Bybit deltas increment u by one; surface the implied
                    // predecessor for gap validation.
                    prev_update_id: book.update_id.checked_sub(1),
                    first_update_id: None,
                    bids,
                    asks,
                })
            };
            return Ok(vec![event]);
        }

        if topic.starts_with("publicTrade.") {
            let trades: Vec<TradeData> = decode(data)?;
            return trades
                .into_iter()
                .filter(|t| t.size > Decimal::ZERO)
                .map(|t| {
                    Ok(CanonicalEvent::Trade(Trade {
                        exchange: Exchange::Bybit,
                        symbol: symbol.to_string(),
                        ts: t.ts,
                        trade_id: t.trade_id,
                        side: parse_side(&t.side)?,
                        price: t.price,
                        size: t.size,
                    }))
                })
                .collect();
        }

        if topic.starts_with("kline.") {
            let klines: Vec<KlineData> = decode(data)?;
            return Ok(klines
                .into_iter()
                .map(|k| {
                    CanonicalEvent::Kline(Kline {
                        exchange: Exchange::Bybit,
                        symbol: symbol.to_string(),
                        interval: KLINE_INTERVAL.to_string(),
                        start: k.start,
                        end: k.end,
                        open: k.open,
                        high: k.high,
                        low: k.low,
                        close: k.close,
                        volume: k.volume,
                        confirm: k.confirm,
                    })
                })
                .collect());
        }

        if topic.starts_with("tickers.") {
            // Ticker deltas omit unchanged fields; only emit when open
            // interest is present.
            let ticker: TickerData = decode(data)?;
            if let Some(open_interest) = ticker.open_interest {
                return Ok(vec![CanonicalEvent::OpenInterest(OpenInterest {
                    exchange: Exchange::Bybit,
                    symbol: symbol.to_string(),
                    ts,
                    open_interest,
                    open_interest_value: ticker.open_interest_value,
                })]);
            }
            return Ok(vec![]);
        }

        if topic.starts_with("allLiquidation.") {
            let liqs: Vec<LiquidationData> = decode(data)?;
            return liqs
                .into_iter()
                .map(|l| {
                    Ok(CanonicalEvent::Liquidation(Liquidation {
                        exchange: Exchange::Bybit,
                        symbol: symbol.to_string(),
                        ts: l.ts,
                        side: parse_side(&l.side)?,
                        price: l.price,
                        quantity: l.size,
                    }))
                })
                .collect();
        }

        Ok(vec![])
    }

    async fn fetch_snapshot(
        &self,
        http: &reqwest::Client,
        symbol: &str,
        depth: usize,
    ) -> Result<BookSnapshot> {
        let response: RestBookResponse = http
            .get(REST_ORDERBOOK)
            .query(&[
                ("category", "linear"),
                ("symbol", symbol),
                ("limit", &depth.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if response.ret_code != 0 {
            return Err(AdapterError::Snapshot(
                response.ret_msg.unwrap_or_else(|| "non-zero retCode".to_string()),
            ));
        }
        let result = response
            .result
            .ok_or_else(|| AdapterError::Snapshot("missing result".to_string()))?;

        Ok(BookSnapshot {
            exchange: Exchange::Bybit,
            symbol: symbol.to_string(),
            ts: result.ts,
            update_id: result.update_id,
            bids: levels(result.bids),
            asks: levels(result.asks),
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
    fn test_parse_book_snapshot() {
        let raw = r#"{
            "topic": "orderbook.200.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304484978,
            "data": {
                "s": "BTCUSDT",
                "b": [["16493.50", "0.006"], ["16493.00", "0.100"]],
                "a": [["16611.00", "0.029"], ["16612.00", "0.213"]],
                "u": 18521288,
                "seq": 7961638724
            }
        }"#;

        let events = BybitAdapter.parse("BTCUSDT", raw).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CanonicalEvent::Snapshot(snap) => {
                assert_eq!(snap.update_id, 18521288);
                assert_eq!(snap.bids[0], Level::new(dec("16493.50"), dec("0.006")));
                assert_eq!(snap.asks.len(), 2);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_book_delta_implied_prev() {
        let raw = r#"{
            "topic": "orderbook.200.BTCUSDT",
            "type": "delta",
            "ts": 1672304484978,
            "data": {
                "s": "BTCUSDT",
                "b": [["16493.50", "0"]],
                "a": [],
                "u": 18521289,
                "seq": 7961638725
            }
        }"#;

        let events = BybitAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Delta(delta) => {
                assert_eq!(delta.update_id, 18521289);
                assert_eq!(delta.prev_update_id, Some(18521288));
                assert!(delta.bids[0].size.is_zero());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_trade_aggressor_side() {
        let raw = r#"{
            "topic": "publicTrade.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304486868,
            "data": [{
                "T": 1672304486865,
                "s": "BTCUSDT",
                "S": "Buy",
                "v": "0.001",
                "p": "16578.50",
                "L": "PlusTick",
                "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
                "BT": false
            }]
        }"#;

        let events = BybitAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Trade(trade) => {
                assert_eq!(trade.side, Side::Buy);
                assert_eq!(trade.price, dec("16578.50"));
                assert_eq!(trade.trade_id, "20f43950-d8dd-5b31-9112-a178eb6023af");
                assert_eq!(trade.ts, 1672304486865);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_op_ack_ignored() {
        let raw = r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#;
        assert!(BybitAdapter.parse("BTCUSDT", raw).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let raw = r#"{"topic":"orderbook.200.BTCUSDT","type":"delta","data":{"b":"nope"}}"#;
        assert!(matches!(
            BybitAdapter.parse("BTCUSDT", raw),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn test_ticker_without_oi_ignored() {
        let raw = r#"{
            "topic": "tickers.BTCUSDT",
            "type": "delta",
            "ts": 1673272861686,
            "data": {"symbol": "BTCUSDT", "markPrice": "17217.33"}
        }"#;
        assert!(BybitAdapter.parse("BTCUSDT", raw).unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_frame_topics() {
        let frames = BybitAdapter.subscribe_frames("BTCUSDT", &Feed::ALL);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("orderbook.200.BTCUSDT"));
        assert!(frames[0].contains("publicTrade.BTCUSDT"));
        assert!(frames[0].contains("allLiquidation.BTCUSDT"));
    }
}
