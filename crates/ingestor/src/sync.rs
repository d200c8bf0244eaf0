//! Book synchronization state machine.
//!
//! Pure (no I/O): the runner feeds it snapshots and deltas, it maintains
//! the local book and yields the truncated DOM after every successful
//! apply. Sequencing contract:
//!
//! 1. While awaiting a snapshot, incoming deltas are buffered.
//! 2. A snapshot drops buffered deltas with `update_id <= snapshot_id`,
//!    then drains the remainder if they chain onto the snapshot.
//! 3. Live deltas must chain exactly (`prev_update_id == last applied`);
//!    a mismatch is a gap and forces a resync.
//!
//! A crossed book after an apply is an invariant violation and also
//! forces a resync.

use common::book::Book;
use common::schema::{BookDelta, BookSnapshot, DomSnapshot, Instrument};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Update-id discontinuity in the live delta stream.
    #[error("sequence gap: expected continuation of {last_applied}, got {got}")]
    Gap { last_applied: u64, got: u64 },

    /// Buffered deltas do not chain onto the snapshot; a fresh snapshot is
    /// required.
    #[error("buffered deltas do not cover snapshot id {snapshot_id}")]
    StaleBuffer { snapshot_id: u64 },

    /// `best_bid >= best_ask` after an apply.
    #[error("crossed book: best bid {bid} >= best ask {ask}")]
    Crossed { bid: Decimal, ask: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    AwaitingSnapshot,
    Live,
}

pub struct BookSync {
    instrument: Instrument,
    depth: usize,
    book: Book,
    state: SyncState,
    buffer: Vec<BookDelta>,
    last_update_id: u64,
    /// Set when the snapshot carried no sequence id (update_id == 0): the
    /// first live delta re-anchors the sequence instead of being checked.
    anchor_on_next_delta: bool,
}

impl BookSync {
    pub fn new(instrument: Instrument, depth: usize) -> Self {
        Self {
            instrument,
            depth,
            book: Book::new(),
            state: SyncState::AwaitingSnapshot,
            buffer: Vec::new(),
            last_update_id: 0,
            anchor_on_next_delta: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    /// Apply a snapshot and drain any buffered deltas that chain onto it.
    pub fn on_snapshot(&mut self, snapshot: &BookSnapshot) -> Result<DomSnapshot, SyncError> {
        self.book.apply_snapshot(&snapshot.bids, &snapshot.asks);
        self.last_update_id = snapshot.update_id;
        self.state = SyncState::Live;
        self.anchor_on_next_delta = snapshot.update_id == 0;

        if self.anchor_on_next_delta {
            // Venue without REST sequencing; buffered deltas cannot be
            // validated against it.
            self.buffer.clear();
            return self.check_and_emit(snapshot.ts);
        }

        let snapshot_id = snapshot.update_id;
        self.buffer.retain(|d| d.update_id > snapshot_id);
        let pending = std::mem::take(&mut self.buffer);
        let mut last = snapshot_id;
        for delta in &pending {
            let chains = match (delta.prev_update_id, delta.first_update_id) {
                (Some(prev), _) => prev <= last,
                (None, Some(first)) => first <= last + 1,
                (None, None) => false,
            };
            if !chains {
                self.state = SyncState::AwaitingSnapshot;
                return Err(SyncError::StaleBuffer { snapshot_id });
            }
            self.book.apply_delta(&delta.bids, &delta.asks);
            last = delta.update_id;
        }
        self.last_update_id = last;
        let ts = pending.last().map(|d| d.ts).unwrap_or(snapshot.ts);
        self.check_and_emit(ts)
    }

    /// Buffer a delta while awaiting a snapshot, or apply it live.
    pub fn on_delta(&mut self, delta: &BookDelta) -> Result<Option<DomSnapshot>, SyncError> {
        match self.state {
            SyncState::AwaitingSnapshot => {
                self.buffer.push(delta.clone());
                Ok(None)
            }
            SyncState::Live => {
                if self.anchor_on_next_delta {
                    self.anchor_on_next_delta = false;
                } else {
                    let chains = match delta.prev_update_id {
                        Some(prev) => prev == self.last_update_id,
                        None => delta.update_id == self.last_update_id + 1,
                    };
                    if !chains {
                        return Err(SyncError::Gap {
                            last_applied: self.last_update_id,
                            got: delta.prev_update_id.unwrap_or(delta.update_id),
                        });
                    }
                }
                self.book.apply_delta(&delta.bids, &delta.asks);
                self.last_update_id = delta.update_id;
                self.check_and_emit(delta.ts).map(Some)
            }
        }
    }

    fn check_and_emit(&mut self, ts: i64) -> Result<DomSnapshot, SyncError> {
        if self.book.crossed() {
            // Unwraps are safe: crossed() is only true with both sides
            // populated.
            let bid = self.book.best_bid().unwrap_or_default();
            let ask = self.book.best_ask().unwrap_or_default();
            self.state = SyncState::AwaitingSnapshot;
            return Err(SyncError::Crossed { bid, ask });
        }
        Ok(DomSnapshot {
            exchange: self.instrument.exchange,
            symbol: self.instrument.symbol.clone(),
            ts,
            update_id: self.last_update_id,
            bids: self.book.top_bids(self.depth),
            asks: self.book.top_asks(self.depth),
        })
    }
}
