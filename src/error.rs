//! Error types for the fleet service.

use std::time::Duration;

/// Top-level error type for fleet operations.
///
/// Each variant maps to one caller-visible outcome; see `api::error` for the
/// HTTP mapping.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("{entity} {id} is {state}, cannot {action}")]
    InvalidState {
        entity: &'static str,
        id: String,
        state: String,
        action: &'static str,
    },

    #[error(
        "Quota exceeded for organization {organization_id}: usage {current_usage} + cost {cost} > limit {limit}"
    )]
    QuotaExceeded {
        organization_id: String,
        current_usage: u64,
        limit: u64,
        cost: u64,
    },

    #[error("{operation} already in progress")]
    ResourceContention { operation: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Dependency failure: {0}")]
    Dependency(#[from] DependencyError),
}

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn contention(operation: impl Into<String>) -> Self {
        Self::ResourceContention {
            operation: operation.into(),
        }
    }

    /// Whether this error is a benign "someone else is doing it" outcome.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::ResourceContention { .. })
    }
}

impl From<DatabaseError> for FleetError {
    fn from(e: DatabaseError) -> Self {
        Self::Dependency(DependencyError::Database(e))
    }
}

impl From<ProvisionError> for FleetError {
    fn from(e: ProvisionError) -> Self {
        Self::Dependency(DependencyError::Provisioning(e))
    }
}

/// Failures of collaborators the core depends on (storage, provisioning).
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the worker provisioning collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Provisioning request failed: {0}")]
    RequestFailed(String),

    #[error("Provisioner rejected {action}: HTTP {status}")]
    Rejected { action: String, status: u16 },

    #[error("Provisioner timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from alert notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Notification endpoint rejected alert: HTTP {0}")]
    Rejected(u16),
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;
