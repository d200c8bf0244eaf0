//! Binance USD-M futures adapter.
//!
//! Subscriptions are encoded in the combined-stream URL; the socket needs
//! no subscribe frames. Book synchronization follows the documented
//! REST-snapshot-plus-buffered-deltas procedure (`U`/`u`/`pu` ids).

use crate::{parse_side, AdapterError, ExchangeAdapter, Feed, Result};
use async_trait::async_trait;
use common::now_ms;
use common::schema::{
    BookDelta, BookSnapshot, CanonicalEvent, Exchange, Kline, Level, Liquidation, Trade,
};
use rust_decimal::Decimal;
use serde::Deserialize;

const WS_BASE: &str = "wss://fstream.binance.com/stream";
const REST_DEPTH: &str = "https://fapi.binance.com/fapi/v1/depth";

#[derive(Debug, Clone, Default)]
pub struct BinanceAdapter;

impl BinanceAdapter {
    fn stream_names(&self, symbol: &str, feeds: &[Feed]) -> Vec<String> {
        let sym = symbol.to_ascii_lowercase();
        feeds
            .iter()
            .filter_map(|feed| match feed {
                Feed::OrderBook => Some(format!("{sym}@depth@100ms")),
                Feed::Trades => Some(format!("{sym}@aggTrade")),
                Feed::Kline => Some(format!("{sym}@kline_1m")),
                // No public open-interest stream on the futures socket.
                Feed::OpenInterest => None,
                Feed::Liquidations => Some(format!("{sym}@forceOrder")),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DepthData {
    #[serde(rename = "E")]
    event_ts: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    update_id: u64,
    #[serde(rename = "pu")]
    prev_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
struct AggTradeData {
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    size: Decimal,
    #[serde(rename = "T")]
    ts: i64,
    /// True when the buyer is the maker, i.e. the aggressor sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct KlineEnvelope {
    #[serde(rename = "k")]
    kline: KlineData,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    start: i64,
    #[serde(rename = "T")]
    end: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "x")]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct ForceOrderEnvelope {
    #[serde(rename = "o")]
    order: ForceOrderData,
}

#[derive(Debug, Deserialize)]
struct ForceOrderData {
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct RestDepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(rename = "T")]
    ts: Option<i64>,
    bids: Vec<(Decimal, Decimal)>,
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
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn ws_url(&self, symbol: &str, feeds: &[Feed]) -> String {
        let streams = self.stream_names(symbol, feeds).join("/");
        format!("{WS_BASE}?streams={streams}")
    }

    fn subscribe_frames(&self, _symbol: &str, _feeds: &[Feed]) -> Vec<String> {
        vec![]
    }

    fn parse(&self, symbol: &str, raw: &str) -> Result<Vec<CanonicalEvent>> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| AdapterError::Protocol(e.to_string()))?;

        if envelope.stream.contains("@depth") {
            let depth: DepthData = decode(envelope.data)?;
            return Ok(vec![CanonicalEvent::Delta(BookDelta {
                exchange: Exchange::Binance,
                symbol: symbol.to_string(),
                ts: depth.event_ts,
                update_id: depth.update_id,
                prev_update_id: Some(depth.prev_update_id),
                first_update_id: Some(depth.first_update_id),
                bids: levels(depth.bids),
                asks: levels(depth.asks),
            })]);
        }

        if envelope.stream.contains("@aggTrade") {
            let trade: AggTradeData = decode(envelope.data)?;
            if trade.size <= Decimal::ZERO {
                return Ok(vec![]);
            }
            let side = if trade.buyer_is_maker {
                common::schema::Side::Sell
            } else {
                common::schema::Side::Buy
            };
            return Ok(vec![CanonicalEvent::Trade(Trade {
                exchange: Exchange::Binance,
                symbol: symbol.to_string(),
                ts: trade.ts,
                trade_id: trade.agg_id.to_string(),
                side,
                price: trade.price,
                size: trade.size,
            })]);
        }

        if envelope.stream.contains("@kline") {
            let k: KlineEnvelope = decode(envelope.data)?;
            return Ok(vec![CanonicalEvent::Kline(Kline {
                exchange: Exchange::Binance,
                symbol: symbol.to_string(),
                interval: "1".to_string(),
                start: k.kline.start,
                end: k.kline.end,
                open: k.kline.open,
                high: k.kline.high,
                low: k.kline.low,
                close: k.kline.close,
                volume: k.kline.volume,
                confirm: k.kline.confirm,
            })]);
        }

        if envelope.stream.contains("@forceOrder") {
            let f: ForceOrderEnvelope = decode(envelope.data)?;
            return Ok(vec![CanonicalEvent::Liquidation(Liquidation {
                exchange: Exchange::Binance,
                symbol: symbol.to_string(),
                ts: f.order.ts,
                side: parse_side(&f.order.side)?,
                price: f.order.price,
                quantity: f.order.quantity,
            })]);
        }

        Ok(vec![])
    }

    async fn fetch_snapshot(
        &self,
        http: &reqwest::Client,
        symbol: &str,
        depth: usize,
    ) -> Result<BookSnapshot> {
        let response: RestDepthResponse = http
            .get(REST_DEPTH)
            .query(&[("symbol", symbol), ("limit", &depth.to_string())])
            .send()
            .await?
            .json()
            .await?;

        Ok(BookSnapshot {
            exchange: Exchange::Binance,
            symbol: symbol.to_string(),
            ts: response.ts.unwrap_or_else(now_ms),
            update_id: response.last_update_id,
            bids: levels(response.bids),
            asks: levels(response.asks),
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
    fn test_parse_depth_delta_ids() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1571889248277,
                "T": 1571889248276,
                "s": "BTCUSDT",
                "U": 390497796,
                "u": 390497878,
                "pu": 390497794,
                "b": [["7403.89", "0.002"]],
                "a": [["7405.96", "3.340"]]
            }
        }"#;

        let events = BinanceAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Delta(delta) => {
                assert_eq!(delta.update_id, 390497878);
                assert_eq!(delta.prev_update_id, Some(390497794));
                assert_eq!(delta.first_update_id, Some(390497796));
                assert_eq!(delta.bids[0].price, dec("7403.89"));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_agg_trade_aggressor_from_maker_flag() {
        let raw = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {
                "e": "aggTrade", "E": 123456789, "s": "BTCUSDT",
                "a": 5933014, "p": "0.001", "q": "100",
                "f": 100, "l": 105, "T": 123456785, "m": true
            }
        }"#;

        let events = BinanceAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Trade(trade) => {
                // Buyer was maker, so the aggressor sold.
                assert_eq!(trade.side, Side::Sell);
                assert_eq!(trade.trade_id, "5933014");
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_force_order_parses_as_liquidation() {
        let raw = r#"{
            "stream": "btcusdt@forceOrder",
            "data": {
                "e": "forceOrder", "E": 1568014460893,
                "o": {
                    "s": "BTCUSDT", "S": "SELL", "o": "LIMIT", "f": "IOC",
                    "q": "0.014", "p": "9910", "ap": "9910", "X": "FILLED",
                    "l": "0.014", "z": "0.014", "T": 1568014460893
                }
            }
        }"#;

        let events = BinanceAdapter.parse("BTCUSDT", raw).unwrap();
        match &events[0] {
            CanonicalEvent::Liquidation(liq) => {
                assert_eq!(liq.side, Side::Sell);
                assert_eq!(liq.quantity, dec("0.014"));
            }
            other => panic!("expected liquidation, got {other:?}"),
        }
    }

    #[test]
    fn test_ws_url_combined_streams() {
        let url = BinanceAdapter.ws_url("BTCUSDT", &[Feed::OrderBook, Feed::Trades]);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@depth@100ms/btcusdt@aggTrade"
        );
    }

    #[test]
    fn test_open_interest_feed_skipped() {
        assert!(BinanceAdapter
            .stream_names("BTCUSDT", &[Feed::OpenInterest])
            .is_empty());
    }
}
