//! Tape aggregator: sliding-window buy/sell volume sums over the trade
//! stream, plus a large-trade flag against the rolling average.

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::schema::{Instrument, Side, StreamRecord, TapeAggregate, TapeWindow, Trade};
use common::streams;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

/// Window labels and widths in ms.
const WINDOWS: [(&str, i64); 3] = [("1s", 1_000), ("5s", 5_000), ("1m", 60_000)];
const MAX_RECENT: usize = 500;
const ROLLING_AVG_TRADES: usize = 100;

pub struct TapeWorker {
    instrument: Instrument,
    recent: VecDeque<Trade>,
}

impl TapeWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            recent: VecDeque::with_capacity(MAX_RECENT),
        }
    }

    /// Window sums relative to `now`. Pure function of the retained
    /// window; a cold start yields empty buckets.
    fn aggregate(&self, now: i64) -> BTreeMap<String, TapeWindow> {
        let mut out = BTreeMap::new();
        for (label, width) in WINDOWS {
            let mut buy_vol = Decimal::ZERO;
            let mut sell_vol = Decimal::ZERO;
            for trade in &self.recent {
                if now - trade.ts > width {
                    continue;
                }
                match trade.side {
                    Side::Buy => buy_vol += trade.size,
                    Side::Sell => sell_vol += trade.size,
                }
            }
            out.insert(
                label.to_string(),
                TapeWindow {
                    buy_vol,
                    sell_vol,
                    delta: buy_vol - sell_vol,
                },
            );
        }
        out
    }

    fn is_large(&self, size: Decimal, mult: Decimal) -> bool {
        let tail: Vec<Decimal> = self
            .recent
            .iter()
            .rev()
            .take(ROLLING_AVG_TRADES)
            .map(|t| t.size)
            .collect();
        if tail.is_empty() {
            return false;
        }
        let avg = tail.iter().copied().sum::<Decimal>() / Decimal::from(tail.len());
        avg > Decimal::ZERO && size >= avg * mult
    }
}

#[async_trait]
impl Worker for TapeWorker {
    fn kind(&self) -> &'static str {
        "tape"
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

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()> {
        let trade = match record {
            StreamRecord::Trade(trade) => trade,
            _ => return Ok(()),
        };

        let large = self.is_large(trade.size, ctx.config.tape_large_mult);
        self.recent.push_back(trade.clone());
        while self.recent.len() > MAX_RECENT {
            self.recent.pop_front();
        }

        let aggregate = TapeAggregate {
            exchange: self.instrument.exchange,
            symbol: self.instrument.symbol.clone(),
            ts: trade.ts,
            windows: self.aggregate(trade.ts),
            last_price: trade.price,
            last_size: trade.size,
            last_side: trade.side,
            large,
        };

        let key = streams::tape(self.instrument.exchange, &self.instrument.symbol);
        ctx.broker
            .kv_set(&key, &aggregate, streams::TAPE_TTL_SECS)
            .await?;
        ctx.broker
            .publish(&key, &StreamRecord::Tape(aggregate))
            .await?;
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

    fn trade(ts: i64, side: Side, size: &str) -> Trade {
        Trade {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            trade_id: format!("{ts}-{side:?}"),
            side,
            price: dec("100"),
            size: dec(size),
        }
    }

    fn worker_with(trades: Vec<Trade>) -> TapeWorker {
        let mut worker = TapeWorker::new(Instrument::new(Exchange::Bybit, "BTCUSDT"));
        worker.recent.extend(trades);
        worker
    }

    #[test]
    fn test_window_sums() {
        let t0 = 1_700_000_000_000;
        let worker = worker_with(vec![
            trade(t0 - 70_000, Side::Buy, "10"), // outside 1m
            trade(t0 - 30_000, Side::Buy, "3"),  // 1m only
            trade(t0 - 2_000, Side::Sell, "2"),  // 5s + 1m
            trade(t0 - 500, Side::Buy, "1"),     // all windows
        ]);

        let windows = worker.aggregate(t0);
        assert_eq!(windows["1s"].buy_vol, dec("1"));
        assert_eq!(windows["1s"].sell_vol, dec("0"));
        assert_eq!(windows["5s"].sell_vol, dec("2"));
        assert_eq!(windows["5s"].delta, dec("-1"));
        assert_eq!(windows["1m"].buy_vol, dec("4"));
        assert_eq!(windows["1m"].delta, dec("2"));
    }

    #[test]
    fn test_cold_start_empty_buckets() {
        let worker = worker_with(vec![]);
        let windows = worker.aggregate(1_700_000_000_000);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows["1m"].buy_vol, Decimal::ZERO);
    }

    #[test]
    fn test_large_trade_flag() {
        let t0 = 1_700_000_000_000;
        let worker = worker_with((0..10).map(|i| trade(t0 + i, Side::Buy, "1")).collect());
        assert!(worker.is_large(dec("3"), dec("3")));
        assert!(!worker.is_large(dec("2.9"), dec("3")));
    }
}
