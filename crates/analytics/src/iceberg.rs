//! Iceberg detector: infers replenishing hidden orders from trade volume
//! consumed at a price level whose visible size keeps refilling.
//!
//! Per (book side, price) state tracks the largest visible size seen, the
//! aggressor volume consumed, and the number of replenishments (size
//! increases after a decrease). When consumed volume reaches `K` times the
//! visible size with at least `R` replenishments inside the window, one
//! ICEBERG event is emitted and the level's state is discarded.

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::schema::{
    DomSnapshot, EventType, Instrument, MarketEvent, Side, StreamRecord, Trade,
};
use common::streams;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

/// Floor for the visible-size denominator.
const EPSILON: &str = "0.0001";

#[derive(Debug, Clone)]
struct LevelState {
    visible_max: Decimal,
    last_visible: Decimal,
    consumed: Decimal,
    replenish_count: u32,
    shrunk_since_peak: bool,
    window_start: i64,
    last_activity: i64,
}

impl LevelState {
    fn new(ts: i64) -> Self {
        Self {
            visible_max: Decimal::ZERO,
            last_visible: Decimal::ZERO,
            consumed: Decimal::ZERO,
            replenish_count: 0,
            shrunk_since_peak: false,
            window_start: ts,
            last_activity: ts,
        }
    }
}

/// Detection parameters, lifted out of `Config` for pure tests.
#[derive(Debug, Clone)]
pub struct IcebergParams {
    pub k: Decimal,
    pub r: u32,
    pub window_ms: i64,
}

pub struct IcebergWorker {
    instrument: Instrument,
    params: Option<IcebergParams>,
    levels: HashMap<(Side, Decimal), LevelState>,
}

impl IcebergWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            params: None,
            levels: HashMap::new(),
        }
    }

    fn params(&mut self, ctx: &WorkerCtx) -> IcebergParams {
        self.params
            .get_or_insert_with(|| IcebergParams {
                k: ctx.config.iceberg_k,
                r: ctx.config.iceberg_r,
                window_ms: ctx.config.iceberg_window_ms,
            })
            .clone()
    }

    /// Observe visible sizes for every tracked level on a DOM update.
    fn observe_dom(&mut self, dom: &DomSnapshot) {
        for ((side, price), state) in self.levels.iter_mut() {
            let ladder = match side {
                Side::Buy => &dom.bids,
                Side::Sell => &dom.asks,
            };
            let visible = ladder
                .iter()
                .find(|level| level.price == *price)
                .map(|level| level.size)
                .unwrap_or(Decimal::ZERO);

            if visible < state.last_visible {
                state.shrunk_since_peak = true;
            } else if visible > state.last_visible && state.shrunk_since_peak {
                state.replenish_count += 1;
                state.shrunk_since_peak = false;
            }
            state.visible_max = state.visible_max.max(visible);
            state.last_visible = visible;
            state.last_activity = dom.ts;
        }
    }

    /// Accumulate consumed volume for the book side the trade hit and test
    /// the heuristic.
    fn observe_trade(&mut self, trade: &Trade, params: &IcebergParams) -> Option<MarketEvent> {
        let book_side = trade.side.consumes();
        let key = (book_side, trade.price);
        let state = self
            .levels
            .entry(key)
            .or_insert_with(|| LevelState::new(trade.ts));

        // Window rollover: start fresh accounting at this level.
        if trade.ts - state.window_start > params.window_ms {
            *state = LevelState::new(trade.ts);
        }
        state.consumed += trade.size;
        state.last_activity = trade.ts;

        let epsilon = Decimal::from_str_exact(EPSILON).unwrap_or(Decimal::ONE);
        let denominator = state.visible_max.max(epsilon);
        if state.consumed / denominator >= params.k && state.replenish_count >= params.r {
            let event = MarketEvent {
                event_type: EventType::Iceberg,
                exchange: self.instrument.exchange,
                symbol: self.instrument.symbol.clone(),
                ts: trade.ts,
                side: book_side,
                price: trade.price,
                payload: serde_json::json!({
                    "consumed": state.consumed.to_string(),
                    "visible_max": state.visible_max.to_string(),
                    "replenish_count": state.replenish_count,
                    "window_start": state.window_start,
                }),
            };
            self.levels.remove(&key);
            return Some(event);
        }
        None
    }

    fn gc(&mut self, now: i64, window_ms: i64) {
        self.levels
            .retain(|_, state| now - state.last_activity <= window_ms);
    }
}

#[async_trait]
impl Worker for IcebergWorker {
    fn kind(&self) -> &'static str {
        "iceberg"
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn streams(&self) -> Vec<String> {
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
        vec![streams::trades(ex, sym), streams::dom(ex, sym)]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(5))
    }

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()> {
        let params = self.params(ctx);
        match record {
            StreamRecord::Dom(dom) => {
                self.observe_dom(dom);
                Ok(())
            }
            StreamRecord::Trade(trade) => {
                if let Some(event) = self.observe_trade(trade, &params) {
                    let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
                    metrics::counter!("iceberg_events_total",
                        "instrument" => self.instrument.to_string())
                    .increment(1);
                    ctx.emit(
                        &streams::events(ex, sym),
                        &StreamRecord::Event(event),
                        streams::EVENTS_MAXLEN,
                    )
                    .await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_tick(&mut self, ctx: &WorkerCtx) -> anyhow::Result<()> {
        let window_ms = self.params(ctx).window_ms;
        self.gc(common::now_ms(), window_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::{Exchange, Level};
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Bybit, "BTCUSDT")
    }

    fn params() -> IcebergParams {
        IcebergParams {
            k: dec("5"),
            r: 3,
            window_ms: 60_000,
        }
    }

    fn dom(ts: i64, bid_size: &str) -> DomSnapshot {
        DomSnapshot {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            update_id: ts as u64,
            bids: vec![Level::new(dec("100.0"), dec(bid_size))],
            asks: vec![Level::new(dec("100.5"), dec("10"))],
        }
    }

    fn sell(ts: i64, size: &str) -> Trade {
        Trade {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            trade_id: format!("{ts}"),
            side: Side::Sell,
            price: dec("100.0"),
            size: dec(size),
        }
    }

    #[test]
    fn test_iceberg_detected_once() {
        // Visible size hovers around 5 with repeated refills while sell
        // aggressors consume 120 at the level over 40 s.
        let mut worker = IcebergWorker::new(instrument());
        let p = params();
        let t0 = 1_700_000_000_000;

        let mut events = Vec::new();
        let sizes = ["5", "2", "5", "1", "5", "2", "5", "3", "5", "4"];
        for (i, size) in sizes.iter().enumerate() {
            let ts = t0 + (i as i64) * 4_000;
            if let Some(ev) = worker.observe_trade(&sell(ts, "12"), &p) {
                events.push(ev);
            }
            worker.observe_dom(&dom(ts + 1, size));
        }

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, EventType::Iceberg);
        assert_eq!(event.side, Side::Buy);
        assert_eq!(event.price, dec("100.0"));
        // Accounting restarted after the emit: only the post-event trades
        // are counted against the fresh state.
        let state = worker.levels.get(&(Side::Buy, dec("100.0"))).unwrap();
        assert_eq!(state.consumed, dec("24"));
        assert_eq!(state.replenish_count, 0);
    }

    #[test]
    fn test_no_event_without_replenishment() {
        // Volume alone is not enough: the visible size never refills.
        let mut worker = IcebergWorker::new(instrument());
        let p = params();
        let t0 = 1_700_000_000_000;

        worker.observe_dom(&dom(t0, "5"));
        let mut events = Vec::new();
        for i in 0..10 {
            if let Some(ev) = worker.observe_trade(&sell(t0 + i * 1_000, "12"), &p) {
                events.push(ev);
            }
        }
        assert!(events.is_empty());
    }

    #[test]
    fn test_window_rollover_resets_accounting() {
        let mut worker = IcebergWorker::new(instrument());
        let p = params();
        let t0 = 1_700_000_000_000;

        worker.observe_trade(&sell(t0, "50"), &p);
        // Next trade falls outside the window: consumed restarts.
        worker.observe_trade(&sell(t0 + p.window_ms + 1, "1"), &p);
        let state = worker.levels.get(&(Side::Buy, dec("100.0"))).unwrap();
        assert_eq!(state.consumed, dec("1"));
        assert_eq!(state.replenish_count, 0);
    }

    #[test]
    fn test_gc_drops_idle_levels() {
        let mut worker = IcebergWorker::new(instrument());
        let p = params();
        let t0 = 1_700_000_000_000;
        worker.observe_trade(&sell(t0, "1"), &p);
        worker.gc(t0 + p.window_ms + 1, p.window_ms);
        assert!(worker.levels.is_empty());
    }
}
