//! Worker fleet management: heartbeat registry, autoscaling, quota admission,
//! connection pool maintenance and alerting.

pub mod alerts;
pub mod api;
pub mod autoscale;
pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod jobs;
pub mod lease;
pub mod pool;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod store;
