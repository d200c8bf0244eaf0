//! Analytics workers: derived streams computed from the raw feeds.

pub mod footprint;
pub mod heatmap;
pub mod iceberg;
pub mod tape;
pub mod trend;
pub mod wallspoof;
pub mod worker;

pub use footprint::FootprintWorker;
pub use heatmap::HeatmapWorker;
pub use iceberg::IcebergWorker;
pub use tape::TapeWorker;
pub use trend::TrendWorker;
pub use wallspoof::WallSpoofWorker;
pub use worker::{run_worker, Worker, WorkerCtx};
