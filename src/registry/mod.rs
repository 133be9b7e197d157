//! Worker registry: heartbeat ingest and pull-based health classification.
//!
//! - `model`: worker records, status derivation, stats and history points
//! - `registry`: `WorkerRegistry` service over the fleet store

pub mod model;
pub mod registry;

pub use model::{
    HeartbeatReport, HeartbeatWrite, StalenessThresholds, WorkerDetail, WorkerHistoryPoint,
    WorkerRecord, WorkerStats, WorkerStatus,
};
pub use registry::{WorkerRegistry, stalest_inactive};
