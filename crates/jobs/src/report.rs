//! Cycle reports published after every job group cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::CycleId;

use crate::types::{JobResult, JobStatus};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Jobs were dispatched (whatever their individual results).
    Completed,
    /// The group feature flag was disabled.
    FeatureDisabled,
    /// The group lease was held elsewhere and no job runs without it.
    LeaseUnavailable,
}

/// Result of one job within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: String,
    pub result: JobResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobRecord {
    pub(crate) fn not_started(job: impl Into<String>, result: JobResult) -> Self {
        Self {
            job: job.into(),
            result,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.result.status()
    }
}

/// Summary of one cycle of a job group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub group: String,
    pub outcome: CycleOutcome,
    pub lease_acquired: bool,
    /// Most severe job status of the cycle.
    pub status: JobStatus,
    /// One record per registered job, in run order.
    pub jobs: Vec<JobRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub(crate) fn new(
        cycle_id: CycleId,
        group: impl Into<String>,
        outcome: CycleOutcome,
        lease_acquired: bool,
        jobs: Vec<JobRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id,
            group: group.into(),
            outcome,
            lease_acquired,
            status: JobStatus::aggregate(jobs.iter().map(JobRecord::status)),
            jobs,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job == name)
    }

    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(JobRecord::status)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
