//! Per-organization quota admission and increase requests.

pub mod controller;
pub mod model;

pub use controller::QuotaController;
pub use model::{
    Admission, MAX_UNITS, OrganizationQuota, QuotaIncrease, QuotaRequest, RequestStatus,
    ReviewDecision, ReviewWrite,
};
