//! Persistence layer: libSQL-backed storage for workers, quotas, jobs and more.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::FleetStore;
