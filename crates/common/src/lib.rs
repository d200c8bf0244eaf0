//! Shared building blocks for the order-flow pipeline: the canonical event
//! model, the order-book container, stream naming, configuration, backoff
//! and the task supervisor.

pub mod backoff;
pub mod book;
pub mod config;
pub mod error;
pub mod schema;
pub mod streams;
pub mod supervisor;

pub use backoff::Backoff;
pub use book::Book;
pub use config::Config;
pub use error::ConfigError;
pub use schema::{
    BookDelta, BookSnapshot, CanonicalEvent, DomSnapshot, EventType, Exchange, Instrument, Kline,
    Level, Liquidation, MarketEvent, OpenInterest, Side, StreamRecord, Trade,
};
pub use supervisor::{Shutdown, Supervisor};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
