//! Per-cycle, per-job execution context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use conductor_core::{CycleId, ServiceScope};
use conductor_lease::HeldLease;

use crate::group::JobGroupOptions;
use crate::types::{JobDescriptor, JobResult, JobStatus};

/// Result of a dependency, as seen by its dependent.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyResult {
    pub name: String,
    pub result: JobResult,
}

/// Everything a job sees during one cycle.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub options: Arc<JobGroupOptions>,
    /// Group lease. Absent for groups without a lease and for run-always jobs
    /// running without it.
    pub lease: Option<Arc<HeldLease>>,
    pub descriptor: JobDescriptor,
    /// Ordered as the dependencies were declared.
    pub depends_on_results: Vec<DependencyResult>,
    pub services: ServiceScope,
    pub cycle_id: CycleId,
}

impl JobContext {
    /// Whether the job currently holds the group lease.
    pub fn has_lease(&self) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_held())
    }

    pub fn dependencies_succeeded(&self) -> bool {
        self.depends_on_results.iter().all(|d| d.result.is_success())
    }

    pub fn dependency(&self, name: &str) -> Option<&JobResult> {
        self.depends_on_results
            .iter()
            .find(|d| d.name == name)
            .map(|d| &d.result)
    }

    /// Cooperative stop point.
    ///
    /// Returns the result a job should return right away: `LostLease` when the
    /// group lease was lost, `Cancelled` when the cycle was cancelled.
    pub fn checkpoint(&self, ct: &CancellationToken) -> Option<JobResult> {
        if self.lease.as_ref().is_some_and(|l| !l.is_held()) {
            return Some(JobResult::lost_lease());
        }
        if ct.is_cancelled() {
            return Some(JobResult::cancelled());
        }
        None
    }

    pub(crate) fn worst_dependency_status(&self) -> JobStatus {
        JobStatus::aggregate(self.depends_on_results.iter().map(|d| d.result.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_lease::LeaseManager;

    fn ctx(deps: Vec<DependencyResult>, lease: Option<Arc<HeldLease>>) -> JobContext {
        JobContext {
            options: Arc::new(JobGroupOptions::new("identity-sync")),
            lease,
            descriptor: JobDescriptor::named("SyncRoles"),
            depends_on_results: deps,
            services: ServiceScope::empty(),
            cycle_id: CycleId::new(),
        }
    }

    #[test]
    fn dependencies_succeeded_requires_all_success() {
        let ok = DependencyResult {
            name: "SyncParties".into(),
            result: JobResult::success(),
        };
        let bad = DependencyResult {
            name: "SyncResources".into(),
            result: JobResult::could_not_run("stale"),
        };

        assert!(ctx(vec![ok.clone()], None).dependencies_succeeded());
        let c = ctx(vec![ok, bad], None);
        assert!(!c.dependencies_succeeded());
        assert_eq!(c.worst_dependency_status(), JobStatus::CouldNotRun);
        assert_eq!(c.dependency("SyncResources").unwrap().status(), JobStatus::CouldNotRun);
    }

    #[tokio::test]
    async fn checkpoint_prefers_lost_lease_over_cancel() {
        let manager = LeaseManager::in_memory();
        let held = HeldLease::acquire(&manager, "identity-sync").await.unwrap().unwrap();
        let c = ctx(Vec::new(), Some(held.clone()));
        let ct = CancellationToken::new();

        assert!(c.checkpoint(&ct).is_none());
        assert!(c.has_lease());

        ct.cancel();
        assert_eq!(c.checkpoint(&ct).unwrap().status(), JobStatus::Cancelled);

        held.release().await.unwrap();
        assert!(!c.has_lease());
        assert_eq!(c.checkpoint(&ct).unwrap().status(), JobStatus::LostLease);
    }
}
