//! Gateway wire protocol: subscription channels, frame envelopes and close
//! codes.
//!
//! Frames are `{stream, data}` envelopes where `stream` is the broker
//! channel name, except the initial DOM frame `{type: "dom", data: ...}`.

use common::schema::Exchange;
use serde::Serialize;

/// Close code for an unknown channel in the subscription.
pub const CLOSE_UNKNOWN_CHANNEL: u16 = 4400;
/// Close code for a client that missed two consecutive pongs.
pub const CLOSE_UNRESPONSIVE: u16 = 1011;

/// Channels a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    OrderbookRealtime,
    TradesRealtime,
    Kline,
    OpenInterest,
    Liquidations,
    HeatmapStream,
    FootprintStream,
    EventsStream,
    ScoresTrend,
    ScoresExhaustion,
    SignalsRuleReversal,
    AiResponse,
}

impl Channel {
    pub const ALL: [Channel; 12] = [
        Channel::OrderbookRealtime,
        Channel::TradesRealtime,
        Channel::Kline,
        Channel::OpenInterest,
        Channel::Liquidations,
        Channel::HeatmapStream,
        Channel::FootprintStream,
        Channel::EventsStream,
        Channel::ScoresTrend,
        Channel::ScoresExhaustion,
        Channel::SignalsRuleReversal,
        Channel::AiResponse,
    ];

    pub fn parse(name: &str) -> Option<Channel> {
        Some(match name {
            "orderbook_realtime" => Channel::OrderbookRealtime,
            "trades_realtime" => Channel::TradesRealtime,
            "kline" => Channel::Kline,
            "open_interest" => Channel::OpenInterest,
            "liquidations" => Channel::Liquidations,
            "heatmap_stream" => Channel::HeatmapStream,
            "footprint_stream" => Channel::FootprintStream,
            "events_stream" => Channel::EventsStream,
            "scores.trend" => Channel::ScoresTrend,
            "scores.exhaustion" => Channel::ScoresExhaustion,
            "signals.rule_reversal" => Channel::SignalsRuleReversal,
            "ai_response" => Channel::AiResponse,
            _ => return None,
        })
    }

    /// Parse a comma-separated channel list; the first unknown name is the
    /// error.
    pub fn parse_set(csv: &str) -> Result<Vec<Channel>, String> {
        let mut out = Vec::new();
        for name in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Channel::parse(name) {
                Some(channel) => {
                    if !out.contains(&channel) {
                        out.push(channel);
                    }
                }
                None => return Err(name.to_string()),
            }
        }
        Ok(out)
    }

    /// The broker pub/sub channel this subscription maps to.
    pub fn pubsub_channel(&self, exchange: Exchange, symbol: &str) -> String {
        use common::streams;
        match self {
            Channel::OrderbookRealtime => streams::dom(exchange, symbol),
            Channel::TradesRealtime => streams::trades(exchange, symbol),
            Channel::Kline => streams::kline(exchange, symbol),
            Channel::OpenInterest => streams::oi(exchange, symbol),
            Channel::Liquidations => streams::liq(exchange, symbol),
            Channel::HeatmapStream => streams::heatmap(exchange, symbol),
            Channel::FootprintStream => streams::footprint(exchange, symbol),
            Channel::EventsStream => streams::events(exchange, symbol),
            Channel::ScoresTrend => streams::scores_trend(exchange, symbol),
            Channel::ScoresExhaustion => streams::scores_exhaustion(exchange, symbol),
            Channel::SignalsRuleReversal => streams::signals_rule_reversal(exchange, symbol),
            Channel::AiResponse => streams::ai_response(exchange, symbol),
        }
    }
}

/// `{stream, data}` envelope for everything after the initial DOM frame.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub stream: &'a str,
    pub data: &'a serde_json::Value,
}

/// Initial DOM frame.
#[derive(Debug, Serialize)]
pub struct DomFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub data: &'a common::schema::DomSnapshot,
}

impl<'a> DomFrame<'a> {
    pub fn new(data: &'a common::schema::DomSnapshot) -> Self {
        Self {
            frame_type: "dom",
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_valid() {
        let channels =
            Channel::parse_set("orderbook_realtime, trades_realtime,scores.trend").unwrap();
        assert_eq!(
            channels,
            vec![
                Channel::OrderbookRealtime,
                Channel::TradesRealtime,
                Channel::ScoresTrend
            ]
        );
    }

    #[test]
    fn test_parse_set_unknown_channel() {
        let err = Channel::parse_set("orderbook_realtime,mystery").unwrap_err();
        assert_eq!(err, "mystery");
    }

    #[test]
    fn test_parse_set_dedup() {
        let channels = Channel::parse_set("kline,kline").unwrap();
        assert_eq!(channels.len(), 1);
    }

    #[test]
    fn test_pubsub_channel_names() {
        assert_eq!(
            Channel::OrderbookRealtime.pubsub_channel(Exchange::Bybit, "BTCUSDT"),
            "dom:bybit:BTCUSDT"
        );
        assert_eq!(
            Channel::SignalsRuleReversal.pubsub_channel(Exchange::Okx, "ETHUSDT"),
            "signals.rule_reversal:okx:ETHUSDT"
        );
    }

    #[test]
    fn test_every_channel_maps_to_a_pubsub_name() {
        for channel in Channel::ALL {
            let name = channel.pubsub_channel(Exchange::Bybit, "X");
            assert!(name.ends_with(":bybit:X"));
        }
    }
}
