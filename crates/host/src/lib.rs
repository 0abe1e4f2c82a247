//! Conductor host: wires the lease manager, the job scheduler and the
//! pipeline host from a `HostConfig`, and runs them until shutdown.

pub mod catalog;
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::{InMemoryFeatureFlags, ServiceProvider};
use conductor_jobs::JobScheduler;
use conductor_lease::{InMemoryLeaseBackend, LeaseManager};
use conductor_pipeline::PipelineHost;

use crate::catalog::CatalogIndex;
use crate::config::HostConfig;

/// Build every component from `config` and run until `shutdown` fires.
pub async fn run(config: HostConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let backend = match config.lease_ttl_secs {
        Some(secs) => InMemoryLeaseBackend::with_ttl(Duration::from_secs(secs)),
        None => InMemoryLeaseBackend::new(),
    };
    let leases = LeaseManager::new(backend);

    let flags = Arc::new(
        config
            .feature_flags
            .iter()
            .fold(InMemoryFeatureFlags::new(), |flags, (name, enabled)| flags.with_flag(name.clone(), *enabled)),
    );
    let index = CatalogIndex::default();
    let services = ServiceProvider::new().with_singleton(index.clone());

    let scheduler = JobScheduler::builder(leases.clone())
        .feature_flags(flags.clone())
        .services(services.clone())
        .group(catalog::catalog_group(&config.catalog))
        .build()
        .context("job registration")?;
    let host = PipelineHost::builder(leases.clone())
        .feature_flags(flags)
        .services(services)
        .group(catalog::heartbeat_group(&config.heartbeat))
        .build()
        .context("pipeline registration")?;

    let mut runs = BroadcastStream::new(host.subscribe());
    let jobs = scheduler.spawn(shutdown.child_token());
    let pipelines = host.spawn(shutdown.child_token());
    tokio::spawn(async move {
        while let Some(record) = runs.next().await {
            match record {
                Ok(record) => debug!(group = %record.group, pipeline = %record.pipeline, outcome = ?record.outcome, "pipeline pass"),
                Err(err) => warn!(error = %err, "pipeline run records lagged"),
            }
        }
    });

    info!(job_groups = ?scheduler.group_names().collect::<Vec<_>>(), "conductor started");
    shutdown.cancelled().await;

    info!("conductor shutting down");
    jobs.shutdown().await;
    pipelines.shutdown().await;

    info!(
        indexed = index.len(),
        cycles = scheduler.stats().cycles_completed,
        leases = ?leases.stats(),
        "conductor stopped"
    );
    Ok(())
}
