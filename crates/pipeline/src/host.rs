//! Pipeline host: runs pipeline groups behind feature flags and leases.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use conductor_core::{AlwaysEnabled, FeatureFlags, ServiceProvider};
use conductor_lease::{HeldLease, LeaseManager};

use crate::error::PipelineError;
use crate::group::{HostedPipeline, PipelineGroup};
use crate::pipeline::{PipelineReport, RunArgs};

const RECORD_CHANNEL_CAPACITY: usize = 64;

/// What the host did with one pipeline in one pass over its group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineRunOutcome {
    Ran(PipelineReport),
    /// The pipeline started but its lease was lost mid-run, cancelling it.
    LeaseLost(PipelineReport),
    FeatureDisabled,
    LeaseUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRunRecord {
    pub group: String,
    pub pipeline: String,
    pub outcome: PipelineRunOutcome,
}

impl PipelineRunRecord {
    pub fn report(&self) -> Option<&PipelineReport> {
        match &self.outcome {
            PipelineRunOutcome::Ran(report) | PipelineRunOutcome::LeaseLost(report) => Some(report),
            _ => None,
        }
    }
}

pub struct PipelineHostBuilder {
    lease_manager: LeaseManager,
    feature_flags: Arc<dyn FeatureFlags>,
    services: ServiceProvider,
    groups: Vec<PipelineGroup>,
}

impl PipelineHostBuilder {
    pub fn feature_flags<F>(mut self, flags: F) -> Self
    where
        F: FeatureFlags + 'static,
    {
        self.feature_flags = Arc::new(flags);
        self
    }

    pub fn services(mut self, services: ServiceProvider) -> Self {
        self.services = services;
        self
    }

    pub fn group(mut self, group: PipelineGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn build(self) -> Result<PipelineHost, PipelineError> {
        let mut names = HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(PipelineError::DuplicateGroup(group.name.clone()));
            }
            if group.pipelines.is_empty() {
                return Err(PipelineError::EmptyGroup(group.name.clone()));
            }
            if group.interval.is_some_and(|i| i.is_zero()) || group.lease_refresh_interval.is_zero() {
                return Err(PipelineError::InvalidInterval(group.name.clone()));
            }

            let mut pipelines = HashSet::new();
            for hosted in &group.pipelines {
                let name = hosted.pipeline.name();
                if !pipelines.insert(name) {
                    return Err(PipelineError::DuplicatePipeline {
                        group: group.name.clone(),
                        pipeline: name.to_string(),
                    });
                }
                if hosted.pipeline.options().capacity == 0 {
                    return Err(PipelineError::InvalidCapacity(name.to_string()));
                }
            }
        }

        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);
        Ok(PipelineHost {
            inner: Arc::new(HostInner {
                lease_manager: self.lease_manager,
                feature_flags: self.feature_flags,
                services: self.services,
                groups: self.groups.into_iter().map(Arc::new).collect(),
                records,
            }),
        })
    }
}

struct HostInner {
    lease_manager: LeaseManager,
    feature_flags: Arc<dyn FeatureFlags>,
    services: ServiceProvider,
    groups: Vec<Arc<PipelineGroup>>,
    records: broadcast::Sender<PipelineRunRecord>,
}

/// Runs registered pipeline groups. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHost {
    inner: Arc<HostInner>,
}

impl PipelineHost {
    pub fn builder(lease_manager: LeaseManager) -> PipelineHostBuilder {
        PipelineHostBuilder {
            lease_manager,
            feature_flags: Arc::new(AlwaysEnabled),
            services: ServiceProvider::new(),
            groups: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineRunRecord> {
        self.inner.records.subscribe()
    }

    /// One pass over every pipeline of `group`, in registration order.
    pub async fn run_group_once(&self, group: &str, ct: &CancellationToken) -> Result<Vec<PipelineRunRecord>, PipelineError> {
        let group = self
            .inner
            .groups
            .iter()
            .find(|g| g.name == group)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownGroup(group.to_string()))?;
        Ok(self.run_pass(&group, ct).await)
    }

    /// Start one loop per group. One-shot groups exit after their first pass.
    pub fn spawn(&self, shutdown: CancellationToken) -> PipelineHostHandle {
        let joins = self
            .inner
            .groups
            .iter()
            .map(|group| {
                let host = self.clone();
                let group = group.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { host.group_loop(group, shutdown).await })
            })
            .collect();

        PipelineHostHandle {
            shutdown,
            joins,
            host: self.clone(),
        }
    }

    async fn group_loop(self, group: Arc<PipelineGroup>, shutdown: CancellationToken) {
        info!(
            group = %group.name,
            pipelines = group.pipelines.len(),
            interval_ms = group.interval.map(|i| i.as_millis() as u64),
            "pipeline group started"
        );

        while !shutdown.is_cancelled() {
            self.run_pass(&group, &shutdown).await;

            let Some(interval) = group.interval else {
                break;
            };
            debug!(group = %group.name, delay_ms = interval.as_millis() as u64, "waiting for next run");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(group = %group.name, "pipeline group stopped");
    }

    async fn run_pass(&self, group: &PipelineGroup, ct: &CancellationToken) -> Vec<PipelineRunRecord> {
        let mut records = Vec::with_capacity(group.pipelines.len());
        for hosted in &group.pipelines {
            if ct.is_cancelled() {
                break;
            }
            let span = info_span!("pipeline_host", group = %group.name, pipeline = %hosted.pipeline.name());
            let outcome = self.run_hosted(group, hosted, ct).instrument(span).await;
            let record = PipelineRunRecord {
                group: group.name.clone(),
                pipeline: hosted.pipeline.name().to_string(),
                outcome,
            };
            let _ = self.inner.records.send(record.clone());
            records.push(record);
        }
        records
    }

    async fn run_hosted(&self, group: &PipelineGroup, hosted: &HostedPipeline, ct: &CancellationToken) -> PipelineRunOutcome {
        if let Some(flag) = &group.feature_flag {
            if !self.inner.feature_flags.is_enabled(flag).await {
                info!(flag = %flag, "pipeline disabled by feature flag");
                return PipelineRunOutcome::FeatureDisabled;
            }
        }

        let lease = match &hosted.lease_name {
            None => None,
            Some(lease_name) => match HeldLease::acquire(&self.inner.lease_manager, lease_name).await {
                Ok(Some(held)) => Some(held),
                Ok(None) => {
                    info!(lease = %lease_name, "lease unavailable; skipping pipeline");
                    return PipelineRunOutcome::LeaseUnavailable;
                }
                Err(err) => {
                    warn!(lease = %lease_name, error = %err, "lease acquisition failed; skipping pipeline");
                    return PipelineRunOutcome::LeaseUnavailable;
                }
            },
        };

        let run_ct = ct.child_token();
        let refresher = lease
            .as_ref()
            .map(|held| held.spawn_refresher(group.lease_refresh_interval, run_ct.clone()));

        let args = RunArgs::new(run_ct.clone())
            .with_lease(lease.clone())
            .with_services(self.inner.services.create_scope());
        let report = hosted.pipeline.run(args).await;

        if let Some(refresher) = refresher {
            refresher.stop().await;
        }
        let mut lost = false;
        if let Some(held) = &lease {
            lost = !held.is_held();
            if lost {
                warn!(outcome = ?report.outcome, "pipeline lease lost during run");
            }
            if let Err(err) = held.release().await {
                warn!(error = %err, "failed to release pipeline lease");
            }
        }
        run_ct.cancel();

        if lost {
            PipelineRunOutcome::LeaseLost(report)
        } else {
            PipelineRunOutcome::Ran(report)
        }
    }
}

impl core::fmt::Debug for PipelineHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineHost")
            .field("groups", &self.inner.groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Handle to control running group loops.
#[derive(Debug)]
pub struct PipelineHostHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    host: PipelineHost,
}

impl PipelineHostHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineRunRecord> {
        self.host.subscribe()
    }

    /// Wait for every group loop to exit without cancelling anything.
    pub async fn join(self) {
        for join in self.joins {
            let _ = join.await;
        }
    }

    /// Cancel running pipelines and wait for every group loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }
}
