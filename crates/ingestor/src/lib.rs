//! Per-(exchange, symbol) ingestion: venue socket in, validated canonical
//! streams out.

pub mod run;
pub mod sync;

pub use run::{run_instrument, IngestorContext};
pub use sync::{BookSync, SyncError, SyncState};
