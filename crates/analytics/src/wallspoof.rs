//! Wall/spoof detector over sampled DOM updates.
//!
//! A wall is a level whose size dominates the median of its depth band and
//! that has rested long enough. A spoof is a level that met the wall size
//! threshold and then vanished (or shrank by 80 %+) within `T2` without a
//! trade at or through its price.

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::schema::{
    DomSnapshot, EventType, Instrument, Level, MarketEvent, Side, StreamRecord, Trade,
};
use common::streams;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Levels per side considered "the band".
const BAND_DEPTH: usize = 20;
/// Shrink fraction that counts as removal.
const SPOOF_SHRINK: &str = "0.2";
/// How long absent levels are remembered beyond T2.
const STATE_SLACK_MS: i64 = 10_000;

#[derive(Debug, Clone)]
struct Residency {
    first_seen: i64,
    /// Largest size observed at the level.
    peak_size: Decimal,
    /// Last time the level was at (or above) the wall size threshold.
    last_big_ts: i64,
    met_threshold: bool,
    wall_emitted: bool,
}

/// Detection parameters, lifted out of `Config` for pure tests.
#[derive(Debug, Clone)]
pub struct WallSpoofParams {
    pub wall_x: Decimal,
    pub t1_ms: i64,
    pub t2_ms: i64,
}

pub struct WallSpoofWorker {
    instrument: Instrument,
    params: Option<WallSpoofParams>,
    levels: HashMap<(Side, Decimal), Residency>,
    recent_trades: VecDeque<Trade>,
}

impl WallSpoofWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            params: None,
            levels: HashMap::new(),
            recent_trades: VecDeque::new(),
        }
    }

    fn params(&mut self, ctx: &WorkerCtx) -> WallSpoofParams {
        self.params
            .get_or_insert_with(|| WallSpoofParams {
                wall_x: ctx.config.wall_x,
                t1_ms: ctx.config.wall_t1_ms,
                t2_ms: ctx.config.spoof_t2_ms,
            })
            .clone()
    }

    fn note_trade(&mut self, trade: &Trade, t2_ms: i64) {
        self.recent_trades.push_back(trade.clone());
        let horizon = trade.ts - t2_ms - STATE_SLACK_MS;
        while self
            .recent_trades
            .front()
            .is_some_and(|t| t.ts < horizon)
        {
            self.recent_trades.pop_front();
        }
    }

    /// True when any trade in `(since, until]` printed at or through the
    /// level price: at-or-below for a bid wall, at-or-above for an ask
    /// wall.
    fn traded_through(&self, side: Side, price: Decimal, since: i64, until: i64) -> bool {
        self.recent_trades.iter().any(|t| {
            t.ts > since
                && t.ts <= until
                && match side {
                    Side::Buy => t.price <= price,
                    Side::Sell => t.price >= price,
                }
        })
    }

    /// Process one DOM sample, emitting wall/spoof events.
    fn observe_dom(&mut self, dom: &DomSnapshot, params: &WallSpoofParams) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        let shrink = Decimal::from_str_exact(SPOOF_SHRINK).unwrap_or_default();

        for (side, ladder) in [(Side::Buy, &dom.bids), (Side::Sell, &dom.asks)] {
            let band: Vec<&Level> = ladder.iter().take(BAND_DEPTH).collect();
            let current: HashMap<Decimal, Decimal> =
                band.iter().map(|l| (l.price, l.size)).collect();

            // Walls: dominate the band median and rest long enough.
            for level in &band {
                let others: Vec<Decimal> = band
                    .iter()
                    .filter(|l| l.price != level.price)
                    .map(|l| l.size)
                    .collect();
                let med = median(&others);
                if med <= Decimal::ZERO {
                    continue;
                }
                let threshold = params.wall_x * med;
                let entry = self
                    .levels
                    .entry((side, level.price))
                    .or_insert_with(|| Residency {
                        first_seen: dom.ts,
                        peak_size: Decimal::ZERO,
                        last_big_ts: 0,
                        met_threshold: false,
                        wall_emitted: false,
                    });
                entry.peak_size = entry.peak_size.max(level.size);
                if level.size >= threshold {
                    entry.met_threshold = true;
                    entry.last_big_ts = dom.ts;
                    if !entry.wall_emitted && dom.ts - entry.first_seen >= params.t1_ms {
                        entry.wall_emitted = true;
                        events.push(MarketEvent {
                            event_type: EventType::Wall,
                            exchange: self.instrument.exchange,
                            symbol: self.instrument.symbol.clone(),
                            ts: dom.ts,
                            side,
                            price: level.price,
                            payload: serde_json::json!({
                                "size": level.size.to_string(),
                                "band_median": med.to_string(),
                                "residency_ms": dom.ts - entry.first_seen,
                            }),
                        });
                    }
                }
            }

            // Spoofs: a threshold-sized level removed or shrunk by 80 %+
            // within T2 with no trade at or through it.
            let keys: Vec<(Side, Decimal)> = self
                .levels
                .keys()
                .filter(|(s, _)| *s == side)
                .copied()
                .collect();
            for key in keys {
                let (_, price) = key;
                let entry = match self.levels.get(&key) {
                    Some(entry) => entry.clone(),
                    None => continue,
                };
                if !entry.met_threshold || entry.last_big_ts == 0 {
                    continue;
                }
                let now_size = current.get(&price).copied().unwrap_or(Decimal::ZERO);
                let vanished = now_size <= entry.peak_size * shrink;
                let within_t2 = dom.ts - entry.last_big_ts <= params.t2_ms;
                if vanished && within_t2 {
                    if !self.traded_through(side, price, entry.last_big_ts, dom.ts) {
                        events.push(MarketEvent {
                            event_type: EventType::Spoof,
                            exchange: self.instrument.exchange,
                            symbol: self.instrument.symbol.clone(),
                            ts: dom.ts,
                            side,
                            price,
                            payload: serde_json::json!({
                                "peak_size": entry.peak_size.to_string(),
                                "remaining": now_size.to_string(),
                            }),
                        });
                    }
                    self.levels.remove(&key);
                } else if !within_t2 && now_size < entry.peak_size * shrink {
                    // Faded too slowly to be a spoof; forget it.
                    self.levels.remove(&key);
                }
            }
        }

        // Drop state for prices long gone from both bands.
        let horizon = dom.ts - params.t2_ms - STATE_SLACK_MS;
        self.levels
            .retain(|_, entry| entry.last_big_ts >= horizon || entry.first_seen >= horizon);

        events
    }
}

fn median(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted[sorted.len() / 2]
}

#[async_trait]
impl Worker for WallSpoofWorker {
    fn kind(&self) -> &'static str {
        "wallspoof"
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn streams(&self) -> Vec<String> {
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
        vec![streams::dom(ex, sym), streams::trades(ex, sym)]
    }

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()> {
        let params = self.params(ctx);
        match record {
            StreamRecord::Trade(trade) => {
                self.note_trade(trade, params.t2_ms);
                Ok(())
            }
            StreamRecord::Dom(dom) => {
                let events = self.observe_dom(dom, &params);
                let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
                for event in events {
                    metrics::counter!("wallspoof_events_total",
                        "instrument" => self.instrument.to_string(),
                        "type" => if event.event_type == EventType::Wall { "wall" } else { "spoof" })
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::Exchange;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Bybit, "BTCUSDT")
    }

    fn params(wall_x: &str, t1: i64, t2: i64) -> WallSpoofParams {
        WallSpoofParams {
            wall_x: dec(wall_x),
            t1_ms: t1,
            t2_ms: t2,
        }
    }

    /// Bid ladder with uniform size 20 except one big level at 99.0.
    fn dom_with_wall(ts: i64, wall_size: &str) -> DomSnapshot {
        let mut bids = vec![Level::new(dec("99.0"), dec(wall_size))];
        for i in 1..10 {
            bids.push(Level::new(dec("99.0") - Decimal::from(i) / dec("10"), dec("20")));
        }
        let asks = (1..10)
            .map(|i| Level::new(dec("100.0") + Decimal::from(i) / dec("10"), dec("20")))
            .collect();
        DomSnapshot {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            update_id: ts as u64,
            bids,
            asks,
        }
    }

    #[test]
    fn test_spoof_on_fast_removal_without_trades() {
        // Wall-sized bid appears at t0, shrinks to 10 at t0+400 with no
        // trade at or below 99.0, T2 = 1000.
        let t0 = 1_700_000_000_000;
        let mut worker = WallSpoofWorker::new(instrument());
        let p = params("10", 5_000, 1_000);

        let events = worker.observe_dom(&dom_with_wall(t0, "500"), &p);
        assert!(events.is_empty()); // residency too short for a wall

        let events = worker.observe_dom(&dom_with_wall(t0 + 400, "10"), &p);
        assert_eq!(events.len(), 1);
        let spoof = &events[0];
        assert_eq!(spoof.event_type, EventType::Spoof);
        assert_eq!(spoof.side, Side::Buy);
        assert_eq!(spoof.price, dec("99.0"));

        // The state was consumed: replaying the shrunken book emits
        // nothing further.
        let events = worker.observe_dom(&dom_with_wall(t0 + 500, "10"), &p);
        assert!(events.is_empty());
    }

    #[test]
    fn test_no_spoof_when_traded_through() {
        let t0 = 1_700_000_000_000;
        let mut worker = WallSpoofWorker::new(instrument());
        let p = params("10", 5_000, 1_000);

        worker.observe_dom(&dom_with_wall(t0, "500"), &p);
        // A sell prints through the level before it vanishes.
        worker.note_trade(
            &Trade {
                exchange: Exchange::Bybit,
                symbol: "BTCUSDT".to_string(),
                ts: t0 + 200,
                trade_id: "x".to_string(),
                side: Side::Sell,
                price: dec("98.9"),
                size: dec("400"),
            },
            p.t2_ms,
        );
        let events = worker.observe_dom(&dom_with_wall(t0 + 400, "10"), &p);
        assert!(events.is_empty());
    }

    #[test]
    fn test_wall_after_residency() {
        let t0 = 1_700_000_000_000;
        let mut worker = WallSpoofWorker::new(instrument());
        let p = params("3", 5_000, 1_000);

        assert!(worker.observe_dom(&dom_with_wall(t0, "100"), &p).is_empty());
        assert!(worker
            .observe_dom(&dom_with_wall(t0 + 2_000, "100"), &p)
            .is_empty());
        let events = worker.observe_dom(&dom_with_wall(t0 + 5_000, "100"), &p);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Wall);
        assert_eq!(events[0].price, dec("99.0"));

        // Emitted once; still resting does not re-emit.
        let events = worker.observe_dom(&dom_with_wall(t0 + 7_000, "100"), &p);
        assert!(events.is_empty());
    }

    #[test]
    fn test_median_band() {
        assert_eq!(
            median(&[dec("1"), dec("20"), dec("20"), dec("20"), dec("500")]),
            dec("20")
        );
        assert_eq!(median(&[]), Decimal::ZERO);
    }
}
