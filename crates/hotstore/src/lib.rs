//! Hot state store: subscribes to raw streams, maintains the authoritative
//! per-instrument DOM, and bridges streams to KV and pub/sub for the
//! gateway.

pub mod service;
pub mod store;

pub use service::HotStoreService;
pub use store::HotStore;
