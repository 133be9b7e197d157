//! Quota admission controller.
//!
//! Admission is a compare-and-increment on the organization's usage: read,
//! check against the limit, then write `usage + cost` only if nobody moved
//! the usage in between. Losers re-read and re-check, and give up with a
//! contention error after `max_admission_attempts`.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    Admission, MAX_UNITS, OrganizationQuota, QuotaIncrease, QuotaRequest, RequestStatus,
    ReviewDecision, ReviewWrite,
};
use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::{FleetError, Result};
use crate::jobs::JobRecord;
use crate::store::FleetStore;

pub struct QuotaController {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl QuotaController {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>, config: QuotaConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Admit a job of `cost` units for `organization_id`, or reject it with
    /// `QuotaExceeded` leaving usage untouched.
    pub async fn submit_job(&self, organization_id: &str, cost: u64) -> Result<Admission> {
        let organization_id = required_field("organization_id", organization_id)?;
        if cost == 0 {
            return Err(FleetError::validation("cost must be greater than 0"));
        }
        if cost > MAX_UNITS {
            return Err(FleetError::validation(format!("cost must not exceed {MAX_UNITS}")));
        }

        for attempt in 1..=self.config.max_admission_attempts {
            let now = self.clock.now();
            let quota = self
                .store
                .ensure_organization(organization_id, self.config.default_limit, now)
                .await?;

            let new_usage = quota.current_usage.saturating_add(cost);
            if new_usage > quota.limit {
                info!(
                    organization_id,
                    current_usage = quota.current_usage,
                    limit = quota.limit,
                    cost,
                    "Job rejected: quota exceeded"
                );
                return Err(FleetError::QuotaExceeded {
                    organization_id: organization_id.to_string(),
                    current_usage: quota.current_usage,
                    limit: quota.limit,
                    cost,
                });
            }

            let job = JobRecord::queued(organization_id, cost, now);
            if self.store.try_admit_job(&job, quota.current_usage).await? {
                info!(
                    organization_id,
                    job_id = %job.id,
                    cost,
                    usage = new_usage,
                    limit = quota.limit,
                    "Job admitted"
                );
                return Ok(Admission {
                    job_id: job.id,
                    organization_id: organization_id.to_string(),
                    cost,
                    current_usage: new_usage,
                    limit: quota.limit,
                });
            }

            debug!(organization_id, attempt, "Usage changed during admission, retrying");
            tokio::task::yield_now().await;
        }

        warn!(
            organization_id,
            attempts = self.config.max_admission_attempts,
            "Quota admission gave up under contention"
        );
        Err(FleetError::contention(format!(
            "quota admission for {organization_id}"
        )))
    }

    /// File a PENDING request to raise an organization's limit.
    pub async fn request_increase(&self, input: QuotaIncrease) -> Result<QuotaRequest> {
        let organization_id = required_field("organization_id", &input.organization_id)?;
        let requested_by = required_field("requested_by", &input.requested_by)?;
        let request_type = input.request_type.trim();
        if request_type.is_empty() {
            return Err(FleetError::validation("request_type must not be empty"));
        }

        if input.requested_limit > MAX_UNITS {
            return Err(FleetError::validation(format!(
                "requested_limit must not exceed {MAX_UNITS}"
            )));
        }

        let now = self.clock.now();
        let quota = self
            .store
            .ensure_organization(organization_id, self.config.default_limit, now)
            .await?;
        if input.requested_limit <= quota.limit {
            return Err(FleetError::validation(format!(
                "requested_limit {} must exceed current limit {}",
                input.requested_limit, quota.limit
            )));
        }

        let request = QuotaRequest {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            requested_by: requested_by.to_string(),
            request_type: request_type.to_string(),
            current_limit: quota.limit,
            requested_limit: input.requested_limit,
            reason: input.reason,
            status: RequestStatus::Pending,
            created_at: now,
            reviewed_by: None,
            reviewed_at: None,
        };
        self.store.insert_quota_request(&request).await?;

        info!(
            request_id = %request.id,
            organization_id,
            current_limit = request.current_limit,
            requested_limit = request.requested_limit,
            "Quota increase requested"
        );
        Ok(request)
    }

    /// Approve or deny a PENDING request. A request is reviewed exactly once.
    pub async fn review(
        &self,
        request_id: Uuid,
        approver_id: &str,
        decision: ReviewDecision,
    ) -> Result<QuotaRequest> {
        let approver_id = required_field("approver_id", approver_id)?;

        match self
            .store
            .review_quota_request(request_id, approver_id, decision, self.clock.now())
            .await?
        {
            ReviewWrite::Applied(request) => {
                info!(
                    request_id = %request_id,
                    approver_id,
                    status = %request.status,
                    organization_id = %request.organization_id,
                    "Quota request reviewed"
                );
                Ok(request)
            }
            ReviewWrite::NotPending(request) => Err(FleetError::InvalidState {
                entity: "quota request",
                id: request_id.to_string(),
                state: request.status.to_string(),
                action: "review",
            }),
            ReviewWrite::Superseded { current_limit, .. } => Err(FleetError::InvalidState {
                entity: "quota request",
                id: request_id.to_string(),
                state: format!("superseded by limit {current_limit}"),
                action: "approve",
            }),
            ReviewWrite::NotFound => Err(FleetError::NotFound {
                entity: "quota request",
                id: request_id.to_string(),
            }),
        }
    }

    pub async fn list_requests(&self, status: Option<RequestStatus>) -> Result<Vec<QuotaRequest>> {
        Ok(self.store.list_quota_requests(status).await?)
    }

    pub async fn get_request(&self, request_id: Uuid) -> Result<QuotaRequest> {
        self.store
            .get_quota_request(request_id)
            .await?
            .ok_or_else(|| FleetError::NotFound {
                entity: "quota request",
                id: request_id.to_string(),
            })
    }

    pub async fn get_quota(&self, organization_id: &str) -> Result<OrganizationQuota> {
        self.store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| FleetError::NotFound {
                entity: "organization",
                id: organization_id.to_string(),
            })
    }
}

fn required_field<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(FleetError::validation(format!("{name} is required")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::jobs::JobStatus;
    use crate::store::LibSqlBackend;

    async fn setup(default_limit: u64) -> (QuotaController, Arc<dyn FleetStore>) {
        let store: Arc<dyn FleetStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let controller = QuotaController::new(
            store.clone(),
            Arc::new(SystemClock),
            QuotaConfig {
                default_limit,
                max_admission_attempts: 8,
            },
        );
        (controller, store)
    }

    fn increase(org: &str, limit: u64) -> QuotaIncrease {
        QuotaIncrease {
            organization_id: org.into(),
            requested_by: "alice".into(),
            request_type: "job_usage".into(),
            requested_limit: limit,
            reason: "launch week".into(),
        }
    }

    #[tokio::test]
    async fn rejects_job_that_would_exceed_limit() {
        let (quota, _store) = setup(100).await;
        quota.submit_job("org", 95).await.unwrap();

        let err = quota.submit_job("org", 10).await.unwrap_err();
        match err {
            FleetError::QuotaExceeded {
                current_usage,
                limit,
                cost,
                ..
            } => assert_eq!((current_usage, limit, cost), (95, 100, 10)),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert_eq!(quota.get_quota("org").await.unwrap().current_usage, 95);
    }

    #[tokio::test]
    async fn admission_records_queued_job() {
        let (quota, store) = setup(100).await;
        let admission = quota.submit_job("org", 100).await.unwrap();
        assert_eq!(admission.current_usage, 100);

        let job = store.get_job(admission.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.cost, 100);
    }

    #[tokio::test]
    async fn rejects_zero_cost_and_missing_org() {
        let (quota, _store) = setup(100).await;
        assert!(matches!(
            quota.submit_job("org", 0).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            quota.submit_job("  ", 1).await,
            Err(FleetError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_submissions_never_exceed_limit() {
        let (quota, _store) = setup(100).await;
        let quota = Arc::new(quota);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let quota = Arc::clone(&quota);
                tokio::spawn(async move { quota.submit_job("org", 10).await })
            })
            .collect();

        let mut admitted = 0u64;
        for handle in futures::future::join_all(handles).await {
            match handle.unwrap() {
                Ok(_) => admitted += 1,
                Err(FleetError::QuotaExceeded { .. }) | Err(FleetError::ResourceContention { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let usage = quota.get_quota("org").await.unwrap().current_usage;
        assert!(usage <= 100);
        assert_eq!(usage, admitted * 10);
        assert!(admitted >= 1);
    }

    #[tokio::test]
    async fn increase_must_exceed_current_limit() {
        let (quota, _store) = setup(100).await;
        assert!(matches!(
            quota.request_increase(increase("org", 100)).await,
            Err(FleetError::Validation(_))
        ));

        let mut no_requester = increase("org", 200);
        no_requester.requested_by = String::new();
        assert!(matches!(
            quota.request_increase(no_requester).await,
            Err(FleetError::Validation(_))
        ));

        let request = quota.request_increase(increase("org", 200)).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.current_limit, 100);
        assert!(request.reviewed_by.is_none() && request.reviewed_at.is_none());
    }

    #[tokio::test]
    async fn approval_raises_limit_and_unblocks_admission() {
        let (quota, _store) = setup(100).await;
        quota.submit_job("org", 95).await.unwrap();
        let request = quota.request_increase(increase("org", 200)).await.unwrap();

        let reviewed = quota
            .review(request.id, "bob", ReviewDecision::Approve)
            .await
            .unwrap();
        assert_eq!(reviewed.status, RequestStatus::Approved);
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("bob"));
        assert!(reviewed.reviewed_at.is_some());

        assert_eq!(quota.get_quota("org").await.unwrap().limit, 200);
        quota.submit_job("org", 10).await.unwrap();
    }

    #[tokio::test]
    async fn second_review_is_invalid_state() {
        let (quota, _store) = setup(100).await;
        let request = quota.request_increase(increase("org", 200)).await.unwrap();
        let first = quota
            .review(request.id, "bob", ReviewDecision::Deny)
            .await
            .unwrap();

        let err = quota
            .review(request.id, "carol", ReviewDecision::Approve)
            .await
            .unwrap_err();
        match err {
            FleetError::InvalidState { state, .. } => assert_eq!(state, "denied"),
            other => panic!("expected InvalidState, got {other:?}"),
        }

        let stored = quota.get_request(request.id).await.unwrap();
        assert_eq!(stored.reviewed_by, first.reviewed_by);
        assert_eq!(stored.reviewed_at, first.reviewed_at);
        assert_eq!(quota.get_quota("org").await.unwrap().limit, 100);
    }

    #[tokio::test]
    async fn quantities_beyond_storage_range_are_rejected() {
        let (quota, _store) = setup(100).await;
        assert!(matches!(
            quota.submit_job("org", MAX_UNITS + 1).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            quota.request_increase(increase("org", u64::MAX)).await,
            Err(FleetError::Validation(_))
        ));

        let request = quota.request_increase(increase("org", MAX_UNITS)).await.unwrap();
        assert_eq!(request.requested_limit, MAX_UNITS);
    }

    #[tokio::test]
    async fn stale_smaller_request_cannot_be_approved() {
        let (quota, _store) = setup(100).await;
        let big = quota.request_increase(increase("org", 500)).await.unwrap();
        let small = quota.request_increase(increase("org", 300)).await.unwrap();
        quota.review(big.id, "bob", ReviewDecision::Approve).await.unwrap();
        quota.submit_job("org", 450).await.unwrap();

        let err = quota
            .review(small.id, "bob", ReviewDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidState { action: "approve", .. }));

        let org = quota.get_quota("org").await.unwrap();
        assert_eq!((org.limit, org.current_usage), (500, 450));
    }

    #[tokio::test]
    async fn review_requires_approver_and_existing_request() {
        let (quota, _store) = setup(100).await;
        let request = quota.request_increase(increase("org", 200)).await.unwrap();
        assert!(matches!(
            quota.review(request.id, " ", ReviewDecision::Approve).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            quota.review(Uuid::new_v4(), "bob", ReviewDecision::Approve).await,
            Err(FleetError::NotFound { .. })
        ));
    }
}
