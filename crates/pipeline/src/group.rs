use std::time::Duration;

use conductor_lease::held::DEFAULT_REFRESH_INTERVAL;

use crate::pipeline::Pipeline;

/// A pipeline registered in a group, with the lease guarding its runs.
#[derive(Debug, Clone)]
pub struct HostedPipeline {
    pub pipeline: Pipeline,
    pub lease_name: Option<String>,
}

/// Pipelines run together by the host, in registration order.
#[derive(Debug, Clone)]
pub struct PipelineGroup {
    pub name: String,
    /// Delay between runs. `None` runs the group once.
    pub interval: Option<Duration>,
    pub feature_flag: Option<String>,
    pub lease_refresh_interval: Duration,
    pub(crate) pipelines: Vec<HostedPipeline>,
}

impl PipelineGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: None,
            feature_flag: None,
            lease_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            pipelines: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
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

    /// Register a pipeline that runs without a lease.
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.push(HostedPipeline {
            pipeline,
            lease_name: None,
        });
        self
    }

    /// Register a pipeline that only runs while holding `lease_name`.
    pub fn leased_pipeline(mut self, lease_name: impl Into<String>, pipeline: Pipeline) -> Self {
        self.pipelines.push(HostedPipeline {
            pipeline,
            lease_name: Some(lease_name.into()),
        });
        self
    }

    pub fn pipelines(&self) -> &[HostedPipeline] {
        &self.pipelines
    }
}
