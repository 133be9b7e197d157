//! Deduplicated failure-rate and performance alerting.

pub mod engine;
pub mod model;
pub mod notifier;

pub use engine::{AlertEngine, window_start};
pub use model::{
    AlertRun, AuditEntry, CheckKind, CheckOutcome, CheckResult, CheckStatus, ScheduledCheckReport,
};
pub use notifier::{AlertNotifier, CompositeNotifier, LogNotifier, WebhookNotifier};
