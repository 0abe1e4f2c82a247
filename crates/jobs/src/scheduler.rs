//! Job scheduler: recurring, lease-guarded cycles over a job dependency graph.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use conductor_core::{AlwaysEnabled, CycleId, FeatureFlags, ServiceProvider};
use conductor_lease::{HeldLease, LeaseManager};

use crate::context::{DependencyResult, JobContext};
use crate::error::{RegistrationError, SchedulerError};
use crate::graph::{JobGraph, build_graph};
use crate::group::{JobEntry, JobGroup, JobGroupOptions};
use crate::report::{CycleOutcome, CycleReport, JobRecord};
use crate::types::{JobResult, JobStatus};

const LEASE_UNAVAILABLE: &str = "lease_unavailable";
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_not_run: u64,
    pub jobs_cancelled: u64,
}

impl SchedulerStats {
    fn record(&mut self, report: &CycleReport) {
        match report.outcome {
            CycleOutcome::Completed => self.cycles_completed += 1,
            CycleOutcome::FeatureDisabled | CycleOutcome::LeaseUnavailable => self.cycles_skipped += 1,
        }
        for job in &report.jobs {
            match job.status() {
                JobStatus::Success => self.jobs_succeeded += 1,
                JobStatus::Failure => self.jobs_failed += 1,
                JobStatus::CouldNotRun | JobStatus::FeatureFlagProhibited => self.jobs_not_run += 1,
                JobStatus::Cancelled | JobStatus::LostLease => self.jobs_cancelled += 1,
            }
        }
    }
}

struct PreparedGroup {
    options: Arc<JobGroupOptions>,
    jobs: Vec<JobEntry>,
    graph: JobGraph,
}

/// Registers job groups and validates them into a [`JobScheduler`].
pub struct JobSchedulerBuilder {
    lease_manager: LeaseManager,
    feature_flags: Arc<dyn FeatureFlags>,
    services: ServiceProvider,
    groups: Vec<JobGroup>,
}

impl JobSchedulerBuilder {
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

    pub fn group(mut self, group: JobGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Validate every group. This is the only place registration errors surface.
    pub fn build(self) -> Result<JobScheduler, RegistrationError> {
        let mut names = HashSet::new();
        let mut groups = Vec::with_capacity(self.groups.len());

        for group in self.groups {
            let name = group.options.name.clone();
            if !names.insert(name.clone()) {
                return Err(RegistrationError::DuplicateGroup(name));
            }
            if group.jobs.is_empty() {
                return Err(RegistrationError::EmptyGroup(name));
            }
            if group.options.interval.is_zero() || group.options.lease_refresh_interval.is_zero() {
                return Err(RegistrationError::InvalidInterval(name));
            }

            let descriptors: Vec<_> = group.jobs.iter().map(|j| j.descriptor.clone()).collect();
            let graph = build_graph(&name, &descriptors)?;
            debug!(group = %name, jobs = descriptors.len(), "job group registered");

            groups.push(Arc::new(PreparedGroup {
                options: Arc::new(group.options),
                jobs: group.jobs,
                graph,
            }));
        }

        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Ok(JobScheduler {
            inner: Arc::new(SchedulerInner {
                lease_manager: self.lease_manager,
                feature_flags: self.feature_flags,
                services: self.services,
                groups,
                reports,
                stats: Mutex::new(SchedulerStats::default()),
            }),
        })
    }
}

struct SchedulerInner {
    lease_manager: LeaseManager,
    feature_flags: Arc<dyn FeatureFlags>,
    services: ServiceProvider,
    groups: Vec<Arc<PreparedGroup>>,
    reports: broadcast::Sender<CycleReport>,
    stats: Mutex<SchedulerStats>,
}

/// Runs registered job groups. Cheap to clone.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn builder(lease_manager: LeaseManager) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            lease_manager,
            feature_flags: Arc::new(AlwaysEnabled),
            services: ServiceProvider::new(),
            groups: Vec::new(),
        }
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.inner.groups.iter().map(|g| g.options.name.as_str())
    }

    /// Receive a copy of every cycle report published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.inner.reports.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        match self.inner.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run one cycle of `group` now.
    ///
    /// `ct` is the parent of the cycle's cancellation token. The lease is
    /// released before this returns, whatever happened during the cycle.
    pub async fn run_cycle(&self, group: &str, ct: &CancellationToken) -> Result<CycleReport, SchedulerError> {
        let prepared = self
            .inner
            .groups
            .iter()
            .find(|g| g.options.name == group)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownGroup(group.to_string()))?;
        Ok(self.cycle(prepared, ct).await)
    }

    /// Start one recurring loop per group. Loops stop when `shutdown` is cancelled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JobSchedulerHandle {
        let joins = self
            .inner
            .groups
            .iter()
            .map(|group| {
                let scheduler = self.clone();
                let group = group.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.group_loop(group, shutdown).await })
            })
            .collect();

        JobSchedulerHandle {
            shutdown,
            joins,
            scheduler: self.clone(),
        }
    }

    async fn group_loop(self, group: Arc<PreparedGroup>, shutdown: CancellationToken) {
        let name = group.options.name.clone();
        let mut ticker = tokio::time::interval(group.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            group = %name,
            interval_ms = group.options.interval.as_millis() as u64,
            "job group started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let _ = self.cycle(group.clone(), &shutdown).await;
        }

        info!(group = %name, "job group stopped");
    }

    async fn cycle(&self, group: Arc<PreparedGroup>, ct: &CancellationToken) -> CycleReport {
        let cycle_id = CycleId::new();
        let span = info_span!("job_cycle", group = %group.options.name, cycle_id = %cycle_id);
        let report = self.execute(group, cycle_id, ct).instrument(span).await;

        match self.inner.stats.lock() {
            Ok(mut stats) => stats.record(&report),
            Err(poisoned) => poisoned.into_inner().record(&report),
        }
        // No subscribers is fine.
        let _ = self.inner.reports.send(report.clone());
        report
    }

    async fn execute(&self, group: Arc<PreparedGroup>, cycle_id: CycleId, ct: &CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let options = group.options.clone();

        if let Some(flag) = &options.feature_flag {
            if !self.inner.feature_flags.is_enabled(flag).await {
                info!(flag = %flag, "group feature flag disabled; skipping cycle");
                let jobs = group
                    .graph
                    .order
                    .iter()
                    .map(|&i| {
                        JobRecord::not_started(
                            group.jobs[i].descriptor.name.clone(),
                            JobResult::feature_flag_prohibited(flag.clone()),
                        )
                    })
                    .collect();
                return CycleReport::new(cycle_id, &options.name, CycleOutcome::FeatureDisabled, false, jobs, started_at);
            }
        }

        let lease = match &options.lease_name {
            None => None,
            Some(lease_name) => match HeldLease::acquire(&self.inner.lease_manager, lease_name).await {
                Ok(held) => held,
                Err(err) => {
                    warn!(lease = %lease_name, error = %err, "lease acquisition failed");
                    None
                }
            },
        };
        let lease_missing = options.lease_name.is_some() && lease.is_none();

        if lease_missing && !group.jobs.iter().any(|j| j.descriptor.run_always) {
            info!("lease unavailable; skipping cycle");
            let jobs = group
                .graph
                .order
                .iter()
                .map(|&i| {
                    JobRecord::not_started(
                        group.jobs[i].descriptor.name.clone(),
                        JobResult::could_not_run(LEASE_UNAVAILABLE),
                    )
                })
                .collect();
            return CycleReport::new(cycle_id, &options.name, CycleOutcome::LeaseUnavailable, false, jobs, started_at);
        }

        let cycle_ct = ct.child_token();
        let refresher = lease
            .as_ref()
            .map(|held| held.spawn_refresher(options.lease_refresh_interval, cycle_ct.clone()));

        let records = self
            .run_jobs(&group, cycle_id, lease.clone(), lease_missing, &cycle_ct)
            .await;

        if let Some(refresher) = refresher {
            refresher.stop().await;
        }
        if let Some(held) = &lease {
            if let Err(err) = held.release().await {
                warn!(error = %err, "failed to release group lease");
            }
        }

        for record in &records {
            let status = record.status();
            if status == JobStatus::Failure {
                warn!(
                    job = %record.job,
                    status = %status,
                    duration_ms = record.duration_ms,
                    data = %record.result.data(),
                    "job finished"
                );
            } else {
                info!(
                    job = %record.job,
                    status = %status,
                    duration_ms = record.duration_ms,
                    "job finished"
                );
            }
        }

        CycleReport::new(cycle_id, &options.name, CycleOutcome::Completed, lease.is_some(), records, started_at)
    }

    /// Dispatch every job of the group; each starts once its dependencies finished.
    async fn run_jobs(
        &self,
        group: &Arc<PreparedGroup>,
        cycle_id: CycleId,
        lease: Option<Arc<HeldLease>>,
        lease_missing: bool,
        ct: &CancellationToken,
    ) -> Vec<JobRecord> {
        let n = group.jobs.len();
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n)
            .map(|_| {
                let (tx, rx) = watch::channel(None::<JobResult>);
                (Some(tx), rx)
            })
            .unzip();
        let mut senders = senders;

        let mut tasks = Vec::with_capacity(n);
        for &i in &group.graph.order {
            let descriptor = group.jobs[i].descriptor.clone();
            let deps: Vec<_> = group.graph.dependencies[i]
                .iter()
                .map(|&d| (group.jobs[d].descriptor.name.clone(), receivers[d].clone()))
                .collect();
            let Some(tx) = senders[i].take() else {
                continue;
            };

            let scheduler = self.clone();
            let group = group.clone();
            let lease = lease.clone();
            let ct = ct.clone();

            tasks.push(tokio::spawn(
                async move {
                    let mut depends_on_results = Vec::with_capacity(deps.len());
                    for (name, mut rx) in deps {
                        let waited = rx.wait_for(|r| r.is_some()).await.map(|r| (*r).clone());
                        let result = match waited {
                            Ok(Some(result)) => result,
                            _ => JobResult::failure(format!("dependency '{name}' ended without a result")),
                        };
                        depends_on_results.push(DependencyResult { name, result });
                    }

                    let ctx = JobContext {
                        options: group.options.clone(),
                        lease,
                        descriptor,
                        depends_on_results,
                        services: scheduler.inner.services.create_scope(),
                        cycle_id,
                    };

                    let record = scheduler.run_one(&group.jobs[i], ctx, lease_missing, &ct).await;
                    let _ = tx.send(Some(record.result.clone()));
                    record
                }
                .in_current_span(),
            ));
        }

        join_all(tasks)
            .await
            .into_iter()
            .zip(group.graph.order.iter())
            .map(|(joined, &i)| {
                joined.unwrap_or_else(|err| {
                    JobRecord::not_started(group.jobs[i].descriptor.name.clone(), JobResult::failure(panic_message(err)))
                })
            })
            .collect()
    }

    async fn run_one(&self, entry: &JobEntry, ctx: JobContext, lease_missing: bool, ct: &CancellationToken) -> JobRecord {
        let started_at = Utc::now();
        let started = Instant::now();
        let name = ctx.descriptor.name.clone();

        let result = self.gate_and_run(entry, ctx, lease_missing, ct).await;

        JobRecord {
            job: name,
            result,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn gate_and_run(&self, entry: &JobEntry, ctx: JobContext, lease_missing: bool, ct: &CancellationToken) -> JobResult {
        if lease_missing && !ctx.descriptor.run_always {
            return JobResult::could_not_run(LEASE_UNAVAILABLE);
        }
        if ct.is_cancelled() {
            return ctx.checkpoint(ct).unwrap_or_else(JobResult::cancelled);
        }
        if let Some(flag) = &ctx.descriptor.feature_flag {
            if !self.inner.feature_flags.is_enabled(flag).await {
                return JobResult::feature_flag_prohibited(flag.clone());
            }
        }

        let ctx = Arc::new(ctx);

        let can_run = {
            let job = entry.job.clone();
            let ctx = ctx.clone();
            let ct = ct.clone();
            tokio::spawn(async move { job.can_run(&ctx, &ct).await }.in_current_span()).await
        };
        match can_run {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                debug!(
                    job = %ctx.descriptor.name,
                    worst_dependency = %ctx.worst_dependency_status(),
                    "job gate closed"
                );
                return JobResult::could_not_run("can_run returned false");
            }
            Ok(Err(err)) => {
                warn!(job = %ctx.descriptor.name, error = %err, "job gate failed");
                return JobResult::could_not_run(format!("can_run failed: {err:#}"));
            }
            Err(err) => {
                warn!(job = %ctx.descriptor.name, "job gate panicked");
                return JobResult::could_not_run(format!("can_run failed: {}", panic_message(err)));
            }
        }

        let run = {
            let job = entry.job.clone();
            let ctx = ctx.clone();
            let ct = ct.clone();
            tokio::spawn(async move { job.run(&ctx, &ct).await }.in_current_span()).await
        };
        match run {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => JobResult::failure(format!("{err:#}")),
            Err(err) => JobResult::failure(panic_message(err)),
        }
    }
}

impl core::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("groups", &self.group_names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("job task aborted: {err}");
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

/// Handle to control running group loops.
#[derive(Debug)]
pub struct JobSchedulerHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    scheduler: JobScheduler,
}

impl JobSchedulerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.scheduler.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Cancel running cycles and wait until every group loop has finalized.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
    }
}
