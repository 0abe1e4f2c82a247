//! Job group registration.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use conductor_lease::held::DEFAULT_REFRESH_INTERVAL;

use crate::job::Job;
use crate::types::JobDescriptor;

/// Options shared by every job of a group; handed to each job via its context.
#[derive(Debug, Clone)]
pub struct JobGroupOptions {
    pub name: String,
    /// Time between cycle starts.
    pub interval: Duration,
    /// Lease taken for the duration of a cycle. `None` runs without a lease.
    pub lease_name: Option<String>,
    /// Group-wide feature flag; a disabled flag skips the cycle.
    pub feature_flag: Option<String>,
    /// How often the lease is refreshed while a cycle runs.
    pub lease_refresh_interval: Duration,
    /// Free-form settings for the group's jobs.
    pub settings: JsonValue,
}

impl JobGroupOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(60),
            lease_name: None,
            feature_flag: None,
            lease_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            settings: JsonValue::Null,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lease(mut self, lease_name: impl Into<String>) -> Self {
        self.lease_name = Some(lease_name.into());
        self
    }

    pub fn with_feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }

    pub fn with_lease_refresh_interval(mut self, every: Duration) -> Self {
        self.lease_refresh_interval = every;
        self
    }

    pub fn with_settings(mut self, settings: JsonValue) -> Self {
        self.settings = settings;
        self
    }

    /// Decode `settings` as `T`.
    pub fn settings_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.settings.clone())
    }
}

pub(crate) struct JobEntry {
    pub(crate) descriptor: JobDescriptor,
    pub(crate) job: Arc<dyn Job>,
}

/// A named set of jobs scheduled together under one lease.
pub struct JobGroup {
    pub(crate) options: JobGroupOptions,
    pub(crate) jobs: Vec<JobEntry>,
}

impl JobGroup {
    pub fn new(options: JobGroupOptions) -> Self {
        Self {
            options,
            jobs: Vec::new(),
        }
    }

    /// Register a job. Registration order breaks ties in the run order.
    pub fn job<J>(mut self, descriptor: JobDescriptor, job: J) -> Self
    where
        J: Job + 'static,
    {
        self.jobs.push(JobEntry {
            descriptor,
            job: Arc::new(job),
        });
        self
    }

    /// Register a job named after its type, with no dependencies.
    pub fn job_default<J>(self, job: J) -> Self
    where
        J: Job + 'static,
    {
        self.job(JobDescriptor::for_job::<J>(), job)
    }

    pub fn options(&self) -> &JobGroupOptions {
        &self.options
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.iter().map(|j| &j.descriptor)
    }
}

impl core::fmt::Debug for JobGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobGroup")
            .field("options", &self.options)
            .field("jobs", &self.descriptors().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}
