//! Queue-driven autoscaling.

pub mod controller;
pub mod model;
pub mod provisioner;

pub use controller::{Autoscaler, TICK_LEASE_KEY, compute_target};
pub use model::{ScalingAction, ScalingDecision, ScalingEvent, TickReport};
pub use provisioner::{LogProvisioner, Provisioner, WebhookProvisioner};
