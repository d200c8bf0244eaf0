//! Footprint aggregator: buckets trades into fixed time bars, grouped by
//! exact trade price, and emits each bar once when it closes.
//!
//! Aggressor mapping: a buy lifts the ask, so buy volume lands in
//! `vol_ask` and sell volume in `vol_bid`; `delta = vol_ask - vol_bid`.
//! Published bars are never mutated; trades older than the closed window
//! are dropped with a counter.

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::schema::{
    FootprintBar, FootprintLevel, ImbalanceLevel, Instrument, Side, StreamRecord, Trade,
};
use common::{now_ms, streams};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;

/// Ratio reported for a level with volume on one side only; the true
/// ratio is unbounded, so it is capped at this sentinel.
const ONE_SIDED_RATIO: &str = "999.99";

#[derive(Debug, Default, Clone, Copy)]
struct LevelVolumes {
    vol_bid: Decimal,
    vol_ask: Decimal,
}

#[derive(Debug)]
struct OpenBar {
    start: i64,
    levels: BTreeMap<Decimal, LevelVolumes>,
}

impl OpenBar {
    fn new(start: i64) -> Self {
        Self {
            start,
            levels: BTreeMap::new(),
        }
    }

    fn add(&mut self, trade: &Trade) {
        let entry = self.levels.entry(trade.price).or_default();
        match trade.side {
            Side::Buy => entry.vol_ask += trade.size,
            Side::Sell => entry.vol_bid += trade.size,
        }
    }
}

/// What happened to an observed trade.
#[derive(Debug)]
enum Observed {
    /// Trade was for an already-published bar.
    Late,
    /// Trade landed in the open bar.
    Added,
    /// Trade opened a new bar; the previous one is finished.
    Rolled(OpenBar),
}

/// Close a bar: compute levels, POC and imbalance levels. POC ties go to
/// the lowest price.
fn close_bar(
    instrument: &Instrument,
    bar: OpenBar,
    bar_ms: i64,
    imbalance_ratio: Decimal,
) -> FootprintBar {
    let levels: Vec<FootprintLevel> = bar
        .levels
        .iter()
        .map(|(price, v)| FootprintLevel {
            price: *price,
            vol_bid: v.vol_bid,
            vol_ask: v.vol_ask,
            delta: v.vol_ask - v.vol_bid,
        })
        .collect();

    let mut poc_price = None;
    let mut poc_total = Decimal::ZERO;
    for level in &levels {
        let total = level.vol_bid + level.vol_ask;
        if poc_price.is_none() || total > poc_total {
            poc_price = Some(level.price);
            poc_total = total;
        }
    }

    let mut imbalance_levels = Vec::new();
    for level in &levels {
        let (max_side, min_side) = if level.vol_ask >= level.vol_bid {
            (level.vol_ask, level.vol_bid)
        } else {
            (level.vol_bid, level.vol_ask)
        };
        // All volume on one side is the extreme imbalance; the ratio is
        // unbounded there, so report the cap instead of dividing.
        let one_sided = min_side.is_zero() && max_side > Decimal::ZERO;
        if one_sided || (min_side > Decimal::ZERO && max_side >= imbalance_ratio * min_side) {
            imbalance_levels.push(ImbalanceLevel {
                price: level.price,
                side: if level.vol_ask >= level.vol_bid {
                    Side::Buy
                } else {
                    Side::Sell
                },
                ratio: if one_sided {
                    Decimal::from_str_exact(ONE_SIDED_RATIO).unwrap_or(imbalance_ratio)
                } else {
                    (max_side / min_side).round_dp(2)
                },
            });
        }
    }

    FootprintBar {
        exchange: instrument.exchange,
        symbol: instrument.symbol.clone(),
        start: bar.start,
        end: bar.start + bar_ms,
        levels,
        poc_price,
        imbalance_levels,
    }
}

pub struct FootprintWorker {
    instrument: Instrument,
    current: Option<OpenBar>,
    /// Start of the most recently emitted bar; nothing at or before this
    /// may be opened again.
    last_emitted_start: i64,
}

impl FootprintWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            current: None,
            last_emitted_start: -1,
        }
    }

    /// Pure bar bookkeeping, separated from I/O for testability.
    fn observe(&mut self, trade: &Trade, bar_ms: i64) -> Observed {
        let bar_start = (trade.ts / bar_ms) * bar_ms;
        if bar_start <= self.last_emitted_start {
            return Observed::Late;
        }

        match &mut self.current {
            None => {
                let mut bar = OpenBar::new(bar_start);
                bar.add(trade);
                self.current = Some(bar);
                Observed::Added
            }
            Some(open) if bar_start == open.start => {
                open.add(trade);
                Observed::Added
            }
            Some(open) if bar_start > open.start => {
                let finished = std::mem::replace(open, OpenBar::new(bar_start));
                open.add(trade);
                Observed::Rolled(finished)
            }
            // Out-of-order within unpublished bars cannot happen with
            // per-instrument ordering; treat as late.
            Some(_) => Observed::Late,
        }
    }

    /// Take the open bar when the wall clock has crossed its end.
    fn close_due(&mut self, now: i64, bar_ms: i64) -> Option<OpenBar> {
        if self
            .current
            .as_ref()
            .is_some_and(|open| now >= open.start + bar_ms)
        {
            self.current.take()
        } else {
            None
        }
    }

    async fn emit(&mut self, ctx: &WorkerCtx, bar: OpenBar) -> anyhow::Result<()> {
        if bar.start <= self.last_emitted_start {
            return Ok(());
        }
        self.last_emitted_start = bar.start;
        let closed = close_bar(
            &self.instrument,
            bar,
            ctx.config.footprint_bar_ms,
            ctx.config.imbalance_ratio,
        );
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
        ctx.emit(
            &streams::footprint(ex, sym),
            &StreamRecord::FootprintBar(closed),
            streams::FOOTPRINT_MAXLEN,
        )
        .await
    }
}

#[async_trait]
impl Worker for FootprintWorker {
    fn kind(&self) -> &'static str {
        "footprint"
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn streams(&self) -> Vec<String> {
        vec![streams::trades(
            self.instrument.exchange,
            &self.instrument.symbol,
        )]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(1_000))
    }

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()> {
        let trade = match record {
            StreamRecord::Trade(trade) => trade,
            _ => return Ok(()),
        };
        match self.observe(trade, ctx.config.footprint_bar_ms) {
            Observed::Added => {}
            Observed::Late => {
                metrics::counter!("footprint_late_trades_total",
                    "instrument" => self.instrument.to_string())
                .increment(1);
            }
            Observed::Rolled(finished) => self.emit(ctx, finished).await?,
        }
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &WorkerCtx) -> anyhow::Result<()> {
        if let Some(finished) = self.close_due(now_ms(), ctx.config.footprint_bar_ms) {
            self.emit(ctx, finished).await?;
        }
        Ok(())
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

    fn trade(ts: i64, side: Side, price: &str, size: &str) -> Trade {
        Trade {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            trade_id: format!("{ts}"),
            side,
            price: dec(price),
            size: dec(size),
        }
    }

    const T0: i64 = 1_700_000_000_000 - (1_700_000_000_000 % 60_000);

    #[test]
    fn test_bar_levels_poc_and_delta() {
        let mut bar = OpenBar::new(T0);
        bar.add(&trade(T0 + 5, Side::Buy, "100.0", "2"));
        bar.add(&trade(T0 + 6, Side::Sell, "100.0", "1"));
        bar.add(&trade(T0 + 100, Side::Buy, "100.5", "4"));

        let closed = close_bar(&instrument(), bar, 60_000, dec("3"));

        assert_eq!(closed.start, T0);
        assert_eq!(closed.end, T0 + 60_000);
        assert_eq!(closed.levels.len(), 2);
        assert_eq!(closed.levels[0].price, dec("100.0"));
        assert_eq!(closed.levels[0].vol_bid, dec("1"));
        assert_eq!(closed.levels[0].vol_ask, dec("2"));
        assert_eq!(closed.levels[0].delta, dec("1"));
        assert_eq!(closed.levels[1].price, dec("100.5"));
        assert_eq!(closed.levels[1].vol_bid, dec("0"));
        assert_eq!(closed.levels[1].vol_ask, dec("4"));
        assert_eq!(closed.levels[1].delta, dec("4"));
        assert_eq!(closed.poc_price, Some(dec("100.5")));
        // 100.0 is 2:1 (below ratio); 100.5 is one-sided and therefore
        // trivially imbalanced.
        assert_eq!(closed.imbalance_levels.len(), 1);
        assert_eq!(closed.imbalance_levels[0].price, dec("100.5"));
        assert_eq!(closed.imbalance_levels[0].side, Side::Buy);
    }

    #[test]
    fn test_imbalance_levels() {
        let mut bar = OpenBar::new(T0);
        bar.add(&trade(T0 + 1, Side::Buy, "100.0", "9"));
        bar.add(&trade(T0 + 2, Side::Sell, "100.0", "3"));
        bar.add(&trade(T0 + 3, Side::Buy, "100.5", "2"));
        bar.add(&trade(T0 + 4, Side::Sell, "100.5", "2"));

        let closed = close_bar(&instrument(), bar, 60_000, dec("3"));
        assert_eq!(closed.imbalance_levels.len(), 1);
        let imb = &closed.imbalance_levels[0];
        assert_eq!(imb.price, dec("100.0"));
        assert_eq!(imb.side, Side::Buy);
        assert_eq!(imb.ratio, dec("3"));
    }

    #[test]
    fn test_one_sided_level_is_imbalanced() {
        let mut bar = OpenBar::new(T0);
        bar.add(&trade(T0 + 1, Side::Sell, "99.5", "4"));

        let closed = close_bar(&instrument(), bar, 60_000, dec("3"));
        assert_eq!(closed.imbalance_levels.len(), 1);
        let imb = &closed.imbalance_levels[0];
        assert_eq!(imb.price, dec("99.5"));
        assert_eq!(imb.side, Side::Sell);
        assert_eq!(imb.ratio, dec("999.99"));
    }

    #[test]
    fn test_poc_tie_goes_to_lowest_price() {
        let mut bar = OpenBar::new(T0);
        bar.add(&trade(T0 + 1, Side::Buy, "100.0", "2"));
        bar.add(&trade(T0 + 2, Side::Buy, "100.5", "2"));
        let closed = close_bar(&instrument(), bar, 60_000, dec("3"));
        assert_eq!(closed.poc_price, Some(dec("100.0")));
    }

    #[test]
    fn test_late_trade_dropped_after_publish() {
        let mut worker = FootprintWorker::new(instrument());
        worker.last_emitted_start = T0;

        let observed = worker.observe(&trade(T0 + 10, Side::Buy, "100.0", "1"), 60_000);
        assert!(matches!(observed, Observed::Late));
        assert!(worker.current.is_none());
        // Published state untouched.
        assert_eq!(worker.last_emitted_start, T0);
    }

    #[test]
    fn test_rollover_finishes_previous_bar() {
        let mut worker = FootprintWorker::new(instrument());
        assert!(matches!(
            worker.observe(&trade(T0 + 10, Side::Buy, "100.0", "1"), 60_000),
            Observed::Added
        ));

        let observed = worker.observe(&trade(T0 + 60_005, Side::Sell, "100.0", "1"), 60_000);
        match observed {
            Observed::Rolled(finished) => assert_eq!(finished.start, T0),
            other => panic!("expected rollover, got {other:?}"),
        }
        assert_eq!(worker.current.as_ref().unwrap().start, T0 + 60_000);
    }

    #[test]
    fn test_time_based_close() {
        let mut worker = FootprintWorker::new(instrument());
        worker.observe(&trade(T0 + 10, Side::Buy, "100.0", "1"), 60_000);

        assert!(worker.close_due(T0 + 30_000, 60_000).is_none());
        let finished = worker.close_due(T0 + 60_000, 60_000).unwrap();
        assert_eq!(finished.start, T0);
        assert!(worker.current.is_none());
    }
}
