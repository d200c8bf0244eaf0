//! In-process hot state: one authoritative DOM per instrument plus a
//! bounded recent-trades ring with trade-id deduplication.
//!
//! The store is the single writer; everything outside this process reads
//! through broker KV or pub/sub.

use common::schema::{DomSnapshot, Instrument, Trade};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};

/// Recent trades kept per instrument.
const RECENT_TRADES: usize = 2_000;
/// Trade ids remembered for dedup, per instrument.
const DEDUP_WINDOW: usize = 4_096;

#[derive(Default)]
struct TradeRing {
    trades: VecDeque<Trade>,
    seen_ids: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl TradeRing {
    /// Insert if unseen; returns false for a duplicate `trade_id`.
    fn insert(&mut self, trade: Trade) -> bool {
        if self.seen_ids.contains(&trade.trade_id) {
            return false;
        }
        self.seen_ids.insert(trade.trade_id.clone());
        self.seen_order.push_back(trade.trade_id.clone());
        while self.seen_order.len() > DEDUP_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_ids.remove(&old);
            }
        }

        self.trades.push_back(trade);
        while self.trades.len() > RECENT_TRADES {
            self.trades.pop_front();
        }
        true
    }
}

/// Shared hot state. Cheap to clone.
#[derive(Clone, Default)]
pub struct HotStore {
    doms: std::sync::Arc<DashMap<Instrument, DomSnapshot>>,
    trades: std::sync::Arc<DashMap<Instrument, TradeRing>>,
}

impl HotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current DOM. The ingestor already validated ordering,
    /// so the hot store trusts stream order.
    pub fn apply_dom(&self, instrument: Instrument, dom: DomSnapshot) {
        self.doms.insert(instrument, dom);
    }

    /// Record a trade; returns false when the id was already seen (the
    /// caller must not re-publish it).
    pub fn apply_trade(&self, instrument: Instrument, trade: Trade) -> bool {
        self.trades.entry(instrument).or_default().insert(trade)
    }

    /// Latest DOM for the gateway's on-connect bootstrap.
    pub fn get_dom(&self, instrument: &Instrument) -> Option<DomSnapshot> {
        self.doms.get(instrument).map(|dom| dom.clone())
    }

    /// Newest-first recent trades, up to `limit`.
    pub fn recent_trades(&self, instrument: &Instrument, limit: usize) -> Vec<Trade> {
        match self.trades.get(instrument) {
            Some(ring) => ring.trades.iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn instrument_count(&self) -> usize {
        self.doms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::{Exchange, Side};
    use rust_decimal::Decimal;

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Bybit, "BTCUSDT")
    }

    fn trade(id: &str, ts: i64) -> Trade {
        Trade {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts,
            trade_id: id.to_string(),
            side: Side::Buy,
            price: Decimal::from(100),
            size: Decimal::ONE,
        }
    }

    #[test]
    fn test_duplicate_trade_ids_dropped() {
        let store = HotStore::new();
        assert!(store.apply_trade(instrument(), trade("a", 1)));
        assert!(store.apply_trade(instrument(), trade("b", 2)));
        // Redelivery of "a" is a no-op.
        assert!(!store.apply_trade(instrument(), trade("a", 1)));
        assert_eq!(store.recent_trades(&instrument(), 10).len(), 2);
    }

    #[test]
    fn test_recent_trades_newest_first() {
        let store = HotStore::new();
        for i in 0..5 {
            store.apply_trade(instrument(), trade(&format!("t{i}"), i));
        }
        let recent = store.recent_trades(&instrument(), 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].trade_id, "t4");
        assert_eq!(recent[2].trade_id, "t2");
    }

    #[test]
    fn test_dom_replaced() {
        let store = HotStore::new();
        let mut dom = DomSnapshot {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts: 1,
            update_id: 10,
            bids: vec![],
            asks: vec![],
        };
        store.apply_dom(instrument(), dom.clone());
        dom.update_id = 11;
        store.apply_dom(instrument(), dom);
        assert_eq!(store.get_dom(&instrument()).unwrap().update_id, 11);
    }

    #[test]
    fn test_trade_ring_bounded() {
        let mut ring = TradeRing::default();
        for i in 0..(RECENT_TRADES + 100) {
            ring.insert(trade(&format!("t{i}"), i as i64));
        }
        assert_eq!(ring.trades.len(), RECENT_TRADES);
    }
}
