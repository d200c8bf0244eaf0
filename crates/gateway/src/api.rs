//! REST surface, all broker-backed: current DOM, recent history tails and
//! worker liveness.

use crate::client::ClientRegistry;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use broker::Broker;
use common::schema::{Exchange, Kline, StreamRecord};
use common::{now_ms, streams};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

const MAX_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct ApiState {
    pub broker: Broker,
    pub registry: Arc<ClientRegistry>,
}

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct KlineQuery {
    pub interval: Option<i64>,
    pub limit: Option<usize>,
}

pub fn rest_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dom/{exchange}/{symbol}", get(dom))
        .route("/trades/{exchange}/{symbol}", get(trades))
        .route("/kline/{exchange}/{symbol}", get(kline))
        .route("/oi/{exchange}/{symbol}", get(open_interest))
        .route("/liquidations/{exchange}/{symbol}", get(liquidations))
        .route("/heatmap/{exchange}/{symbol}", get(heatmap))
        .route("/footprint/{exchange}/{symbol}", get(footprint))
        .route("/events/{exchange}/{symbol}", get(events))
        .route("/tape/{exchange}/{symbol}", get(tape))
        .route("/scores/trend/{exchange}/{symbol}", get(scores_trend))
        .route("/scores/exhaustion/{exchange}/{symbol}", get(scores_exhaustion))
        .route("/signals/rule/{exchange}/{symbol}", get(signals_rule))
        .with_state(state)
}

fn parse_exchange(raw: &str) -> Result<Exchange, (StatusCode, String)> {
    Exchange::from_str(raw).map_err(|err| (StatusCode::BAD_REQUEST, err))
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn health(State(state): State<ApiState>) -> ApiResult {
    let keys = state
        .broker
        .kv_keys(streams::WORKER_HEARTBEAT_PATTERN)
        .await
        .map_err(internal)?;
    let now = now_ms();
    let mut tasks = Vec::with_capacity(keys.len());
    for key in keys {
        let beat: Option<i64> = state.broker.kv_get(&key).await.map_err(internal)?;
        let name = key
            .strip_prefix("worker:")
            .and_then(|k| k.strip_suffix(":hb"))
            .unwrap_or(&key)
            .to_string();
        if let Some(beat) = beat {
            tasks.push(json!({
                "name": name,
                "state": "running",
                "last_hb_ms_ago": now - beat,
            }));
        }
    }
    tasks.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(Json(json!({
        "status": "ok",
        "clients": state.registry.client_count(),
        "tasks": tasks,
    })))
}

async fn dom(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let dom: Option<common::schema::DomSnapshot> = state
        .broker
        .kv_get(&streams::dom(exchange, &symbol))
        .await
        .map_err(internal)?;
    match dom {
        Some(dom) => Ok(Json(serde_json::to_value(dom).map_err(internal)?)),
        None => Err((StatusCode::NOT_FOUND, "no dom for instrument".to_string())),
    }
}

/// Newest-first tail of one stream, filtered and serialized.
async fn tail_records<F>(
    state: &ApiState,
    stream: &str,
    limit: usize,
    select: F,
) -> Result<Vec<Value>, (StatusCode, String)>
where
    F: Fn(StreamRecord) -> Option<Value>,
{
    let limit = limit.clamp(1, MAX_LIMIT);
    let messages = state
        .broker
        .stream_tail(stream, limit)
        .await
        .map_err(internal)?;
    Ok(messages
        .into_iter()
        .filter_map(|m| select(m.record))
        .collect())
}

async fn trades(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::trades(exchange, &symbol),
        query.limit.unwrap_or(100),
        |record| match record {
            StreamRecord::Trade(trade) => serde_json::to_value(trade).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn kline(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<KlineQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let interval = query.interval.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(200).clamp(1, MAX_LIMIT);

    // Newest-first; the stream may carry several updates of the same
    // candle, the first hit per start wins.
    let messages = state
        .broker
        .stream_tail(
            &streams::kline(exchange, &symbol),
            (limit * interval as usize * 4).min(streams::KLINE_MAXLEN),
        )
        .await
        .map_err(internal)?;

    let mut latest: BTreeMap<i64, Kline> = BTreeMap::new();
    for message in messages {
        if let StreamRecord::Kline(kline) = message.record {
            latest.entry(kline.start).or_insert(kline);
        }
    }

    let candles: Vec<Kline> = if interval == 1 {
        latest.into_values().collect()
    } else {
        aggregate_klines(latest.into_values().collect(), interval)
    };
    let skip = candles.len().saturating_sub(limit);
    let out: Vec<Value> = candles
        .into_iter()
        .skip(skip)
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();
    Ok(Json(Value::Array(out)))
}

/// Merge ascending 1-minute candles into `interval`-minute buckets.
fn aggregate_klines(candles: Vec<Kline>, interval: i64) -> Vec<Kline> {
    let bucket_ms = interval * 60_000;
    let mut buckets: BTreeMap<i64, Kline> = BTreeMap::new();
    for candle in candles {
        let start = (candle.start / bucket_ms) * bucket_ms;
        match buckets.get_mut(&start) {
            None => {
                let mut merged = candle;
                merged.start = start;
                merged.end = start + bucket_ms;
                merged.interval = interval.to_string();
                buckets.insert(start, merged);
            }
            Some(merged) => {
                merged.high = merged.high.max(candle.high);
                merged.low = if merged.low.is_zero() {
                    candle.low
                } else {
                    merged.low.min(candle.low)
                };
                merged.close = candle.close;
                merged.volume += candle.volume;
                merged.confirm = merged.confirm && candle.confirm;
            }
        }
    }
    buckets.into_values().collect()
}

async fn open_interest(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::oi(exchange, &symbol),
        query.limit.unwrap_or(100),
        |record| match record {
            StreamRecord::OpenInterest(oi) => serde_json::to_value(oi).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn liquidations(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::liq(exchange, &symbol),
        query.limit.unwrap_or(100),
        |record| match record {
            StreamRecord::Liquidation(liq) => serde_json::to_value(liq).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn heatmap(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::heatmap(exchange, &symbol),
        query.limit.unwrap_or(100),
        |record| match record {
            StreamRecord::HeatmapSlice(slice) => serde_json::to_value(slice).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn footprint(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::footprint(exchange, &symbol),
        query.limit.unwrap_or(50),
        |record| match record {
            StreamRecord::FootprintBar(bar) => serde_json::to_value(bar).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn events(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::events(exchange, &symbol),
        query.limit.unwrap_or(50),
        |record| match record {
            StreamRecord::Event(event) => serde_json::to_value(event).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn scores_trend(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::scores_trend(exchange, &symbol),
        query.limit.unwrap_or(200),
        |record| match record {
            StreamRecord::TrendScore(score) => serde_json::to_value(score).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn scores_exhaustion(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::scores_exhaustion(exchange, &symbol),
        query.limit.unwrap_or(200),
        |record| match record {
            StreamRecord::ExhaustionScore(score) => serde_json::to_value(score).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn signals_rule(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let out = tail_records(
        &state,
        &streams::signals_rule_reversal(exchange, &symbol),
        query.limit.unwrap_or(200),
        |record| match record {
            StreamRecord::RuleReversal(signal) => serde_json::to_value(signal).ok(),
            _ => None,
        },
    )
    .await?;
    Ok(Json(Value::Array(out)))
}

async fn tape(
    State(state): State<ApiState>,
    Path((exchange, symbol)): Path<(String, String)>,
) -> ApiResult {
    let exchange = parse_exchange(&exchange)?;
    let aggregate: Option<common::schema::TapeAggregate> = state
        .broker
        .kv_get(&streams::tape(exchange, &symbol))
        .await
        .map_err(internal)?;
    match aggregate {
        Some(aggregate) => Ok(Json(serde_json::to_value(aggregate).map_err(internal)?)),
        None => Ok(Json(json!({}))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::Exchange;
    use rust_decimal::Decimal;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn candle(start: i64, open: &str, high: &str, low: &str, close: &str, vol: &str) -> Kline {
        Kline {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            interval: "1".to_string(),
            start,
            end: start + 60_000,
            open: dec(open),
            high: dec(high),
            low: dec(low),
            close: dec(close),
            volume: dec(vol),
            confirm: true,
        }
    }

    #[test]
    fn test_aggregate_klines_five_minute() {
        let candles = vec![
            candle(0, "10", "12", "9", "11", "1"),
            candle(60_000, "11", "15", "10", "14", "2"),
            candle(300_000, "14", "16", "13", "15", "3"),
        ];
        let merged = aggregate_klines(candles, 5);
        assert_eq!(merged.len(), 2);

        let first = &merged[0];
        assert_eq!(first.start, 0);
        assert_eq!(first.end, 300_000);
        assert_eq!(first.open, dec("10"));
        assert_eq!(first.high, dec("15"));
        assert_eq!(first.low, dec("9"));
        assert_eq!(first.close, dec("14"));
        assert_eq!(first.volume, dec("3"));
        assert_eq!(first.interval, "5");

        assert_eq!(merged[1].start, 300_000);
    }
}
