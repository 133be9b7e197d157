//! Connection pool manager.

pub mod manager;
pub mod model;

pub use manager::{MAINTENANCE_LEASE_KEY, PoolLease, PoolManager};
pub use model::{ConfigureReport, PoolSnapshot, ResetReport};
