//! Job statuses, results and descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// Outcome category of one job run.
///
/// Variants are ordered by severity; a cycle's aggregate status is the most
/// severe status of its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    CouldNotRun,
    LostLease,
    FeatureFlagProhibited,
    Cancelled,
    Failure,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }

    /// Most severe status, or `Success` for an empty iterator.
    pub fn aggregate(statuses: impl IntoIterator<Item = JobStatus>) -> JobStatus {
        statuses.into_iter().max().unwrap_or(JobStatus::Success)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            JobStatus::Success => "success",
            JobStatus::CouldNotRun => "could_not_run",
            JobStatus::LostLease => "lost_lease",
            JobStatus::FeatureFlagProhibited => "feature_flag_prohibited",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Result of one job run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    status: JobStatus,
    #[serde(default)]
    data: JsonValue,
}

impl JobResult {
    pub fn new(status: JobStatus, data: JsonValue) -> Self {
        Self { status, data }
    }

    pub fn success() -> Self {
        Self::new(JobStatus::Success, JsonValue::Null)
    }

    /// Success carrying diagnostic data for dependents and the cycle report.
    pub fn success_with(data: JsonValue) -> Self {
        Self::new(JobStatus::Success, data)
    }

    pub fn could_not_run(reason: impl Into<String>) -> Self {
        Self::new(JobStatus::CouldNotRun, json!({ "reason": reason.into() }))
    }

    pub fn lost_lease() -> Self {
        Self::new(JobStatus::LostLease, JsonValue::Null)
    }

    pub fn feature_flag_prohibited(flag: impl Into<String>) -> Self {
        Self::new(JobStatus::FeatureFlagProhibited, json!({ "flag": flag.into() }))
    }

    pub fn cancelled() -> Self {
        Self::new(JobStatus::Cancelled, JsonValue::Null)
    }

    pub fn failure(error: impl core::fmt::Display) -> Self {
        Self::new(JobStatus::Failure, json!({ "error": error.to_string() }))
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Static description of a registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    /// Names of jobs that must finish before this one starts, in declaration order.
    pub dependencies: Vec<String>,
    /// Run even when the group lease could not be acquired.
    pub run_always: bool,
    /// Per-job feature flag; the job is skipped when the flag is disabled.
    pub feature_flag: Option<String>,
}

impl JobDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            run_always: false,
            feature_flag: None,
        }
    }

    /// Descriptor named after the job's Rust type.
    pub fn for_job<J: ?Sized>() -> Self {
        Self::named(job_name::<J>())
    }

    pub fn depends_on<J: ?Sized>(self) -> Self {
        self.depends_on_name(job_name::<J>())
    }

    pub fn depends_on_name(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn run_always(mut self) -> Self {
        self.run_always = true;
        self
    }

    pub fn feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }
}

/// Default job name: the type name without its module path.
pub fn job_name<J: ?Sized>() -> String {
    let full = std::any::type_name::<J>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
