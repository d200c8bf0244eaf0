//! Heatmap aggregator: samples the KV DOM once a second and bins book
//! volume by price.

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::schema::{DomSnapshot, HeatmapRow, HeatmapSlice, Instrument, StreamRecord};
use common::streams;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct HeatmapWorker {
    instrument: Instrument,
    /// Timestamp of the last emitted slice, to skip identical samples when
    /// the book is quiet.
    last_slice_ts: i64,
}

impl HeatmapWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            last_slice_ts: 0,
        }
    }
}

/// Bin a DOM into heatmap rows: `bin = round(price / bin_size) * bin_size`,
/// rows ascending by bin. Deterministic: the same DOM and bin size always
/// produce identical rows.
pub fn bin_dom(dom: &DomSnapshot, bin_size: Decimal) -> Vec<HeatmapRow> {
    if bin_size <= Decimal::ZERO {
        return Vec::new();
    }
    let mut bins: BTreeMap<Decimal, (Decimal, Decimal)> = BTreeMap::new();
    for level in &dom.bids {
        let bin = (level.price / bin_size).round() * bin_size;
        bins.entry(bin).or_default().0 += level.size;
    }
    for level in &dom.asks {
        let bin = (level.price / bin_size).round() * bin_size;
        bins.entry(bin).or_default().1 += level.size;
    }
    bins.into_iter()
        .map(|(price_bin, (vol_bid, vol_ask))| HeatmapRow {
            price_bin,
            vol_bid,
            vol_ask,
        })
        .collect()
}

#[async_trait]
impl Worker for HeatmapWorker {
    fn kind(&self) -> &'static str {
        "heatmap"
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn streams(&self) -> Vec<String> {
        // Pure sampler: reads the KV DOM on a timer.
        vec![]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(1_000))
    }

    async fn on_record(&mut self, _ctx: &WorkerCtx, _record: &StreamRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &WorkerCtx) -> anyhow::Result<()> {
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
        let dom: Option<DomSnapshot> = ctx.broker.kv_get(&streams::dom(ex, sym)).await?;
        let dom = match dom {
            Some(dom) if dom.ts != self.last_slice_ts => dom,
            _ => return Ok(()),
        };

        let bin_size = ctx.config.bin_size(ex, sym);
        let rows = bin_dom(&dom, bin_size);
        if rows.is_empty() {
            return Ok(());
        }
        self.last_slice_ts = dom.ts;

        let slice = HeatmapSlice {
            exchange: ex,
            symbol: sym.to_string(),
            ts: dom.ts,
            rows,
        };
        ctx.emit(
            &streams::heatmap(ex, sym),
            &StreamRecord::HeatmapSlice(slice),
            streams::HEATMAP_MAXLEN,
        )
        .await
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

    fn dom() -> DomSnapshot {
        DomSnapshot {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts: 1_700_000_000_000,
            update_id: 10,
            bids: vec![
                Level::new(dec("100.2"), dec("5")),
                Level::new(dec("99.9"), dec("3")),
                Level::new(dec("99.2"), dec("2")),
            ],
            asks: vec![
                Level::new(dec("100.6"), dec("1")),
                Level::new(dec("101.4"), dec("4")),
            ],
        }
    }

    #[test]
    fn test_binning() {
        let rows = bin_dom(&dom(), dec("1"));
        // 100.2 -> 100, 99.9 -> 100, 99.2 -> 99, 100.6 -> 101, 101.4 -> 101.
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].price_bin, dec("99"));
        assert_eq!(rows[0].vol_bid, dec("2"));
        assert_eq!(rows[1].price_bin, dec("100"));
        assert_eq!(rows[1].vol_bid, dec("8"));
        assert_eq!(rows[1].vol_ask, Decimal::ZERO);
        assert_eq!(rows[2].price_bin, dec("101"));
        assert_eq!(rows[2].vol_ask, dec("5"));
    }

    #[test]
    fn test_rebinning_is_idempotent() {
        let first = bin_dom(&dom(), dec("1"));
        let second = bin_dom(&dom(), dec("1"));
        assert_eq!(first, second);
        // Byte-identical on the wire, too.
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_zero_bin_size_yields_nothing() {
        assert!(bin_dom(&dom(), Decimal::ZERO).is_empty());
    }
}
