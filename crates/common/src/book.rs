//! In-memory order book with sorted price levels.
//!
//! Uses BTreeMap for O(log n) level operations with automatic sorting:
//! bids iterate descending, asks ascending.

use crate::schema::{Level, Side};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Price-sorted bid and ask ladders at a point in time.
///
/// Invariants after every apply: no duplicate prices (map keys), no
/// zero-size levels, and `best_bid < best_ask` whenever both sides are
/// non-empty (checked by the owner via [`Book::crossed`]).
#[derive(Debug, Clone, Default)]
pub struct Book {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole book with snapshot levels. Zero-size entries are
    /// skipped.
    pub fn apply_snapshot(&mut self, bids: &[Level], asks: &[Level]) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if level.size > Decimal::ZERO {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size > Decimal::ZERO {
                self.asks.insert(level.price, level.size);
            }
        }
    }

    /// Apply a delta: size zero removes the level, anything else upserts it.
    pub fn apply_delta(&mut self, bids: &[Level], asks: &[Level]) {
        for level in bids {
            if level.size.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.size);
            }
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// True when both sides are non-empty and `best_bid >= best_ask`.
    pub fn crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Size resting at an exact price on one side, zero if absent.
    pub fn size_at(&self, side: Side, price: Decimal) -> Decimal {
        let map = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        map.get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    /// Top `n` bid levels, best (highest) first.
    pub fn top_bids(&self, n: usize) -> Vec<Level> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, s)| Level::new(*p, *s))
            .collect()
    }

    /// Top `n` ask levels, best (lowest) first.
    pub fn top_asks(&self, n: usize) -> Vec<Level> {
        self.asks
            .iter()
            .take(n)
            .map(|(p, s)| Level::new(*p, *s))
            .collect()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn lvl(price: &str, size: &str) -> Level {
        Level::new(
            Decimal::from_str(price).unwrap(),
            Decimal::from_str(size).unwrap(),
        )
    }

    fn seeded_book() -> Book {
        let mut book = Book::new();
        book.apply_snapshot(
            &[lvl("100", "5"), lvl("99", "3")],
            &[lvl("101", "2"), lvl("102", "4")],
        );
        book
    }

    #[test]
    fn test_snapshot_apply() {
        let book = seeded_book();
        assert_eq!(book.best_bid(), Some(Decimal::from(100)));
        assert_eq!(book.best_ask(), Some(Decimal::from(101)));
        assert!(!book.crossed());
    }

    #[test]
    fn test_delta_remove_and_insert() {
        // Scenario: delta removes bid@99 and inserts bid@98.
        let mut book = seeded_book();
        book.apply_delta(&[lvl("99", "0"), lvl("98", "7")], &[]);

        assert_eq!(book.top_bids(10), vec![lvl("100", "5"), lvl("98", "7")]);
        assert_eq!(book.top_asks(10), vec![lvl("101", "2"), lvl("102", "4")]);
    }

    #[test]
    fn test_no_zero_levels_survive() {
        let mut book = seeded_book();
        book.apply_delta(&[lvl("100", "0")], &[lvl("101", "0")]);
        assert_eq!(book.bid_levels(), 1);
        assert_eq!(book.ask_levels(), 1);
        assert_eq!(book.size_at(Side::Buy, Decimal::from(100)), Decimal::ZERO);
    }

    #[test]
    fn test_snapshot_skips_zero_sizes() {
        let mut book = Book::new();
        book.apply_snapshot(&[lvl("100", "0"), lvl("99", "1")], &[]);
        assert_eq!(book.bid_levels(), 1);
    }

    #[test]
    fn test_crossed_detection() {
        let mut book = Book::new();
        book.apply_snapshot(&[lvl("101", "1")], &[lvl("100", "1")]);
        assert!(book.crossed());
    }

    #[test]
    fn test_top_truncation_order() {
        let mut book = Book::new();
        book.apply_snapshot(
            &[lvl("98", "1"), lvl("100", "1"), lvl("99", "1")],
            &[lvl("103", "1"), lvl("101", "1"), lvl("102", "1")],
        );
        let bids = book.top_bids(2);
        assert_eq!(bids[0].price, Decimal::from(100));
        assert_eq!(bids[1].price, Decimal::from(99));
        let asks = book.top_asks(2);
        assert_eq!(asks[0].price, Decimal::from(101));
        assert_eq!(asks[1].price, Decimal::from(102));
    }
}
