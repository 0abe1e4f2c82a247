//! Catalog sync: a job group whose indexing job drives a pipeline, plus the
//! heartbeat pipeline group run by the pipeline host.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conductor_jobs::types::job_name;
use conductor_jobs::{Job, JobContext, JobDescriptor, JobGroup, JobGroupOptions, JobResult};
use conductor_pipeline::{
    Pipeline, PipelineGroup, PipelineOptions, PipelineOutcome, RunArgs, SegmentContext, SinkContext,
};

use crate::config::{CatalogConfig, HeartbeatConfig};

pub const CATALOG_GROUP: &str = "catalog";
pub const HEARTBEAT_GROUP: &str = "heartbeat";

/// Shared in-memory search index, registered as a singleton service.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    entries: Arc<Mutex<BTreeMap<u64, String>>>,
}

impl CatalogIndex {
    pub fn upsert(&self, id: u64, document: String) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(id, document);
    }

    pub fn get(&self, id: u64) -> Option<String> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group settings read by the catalog jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSettings {
    pub page_size: u32,
}

#[derive(Debug, Deserialize)]
struct FetchedPage {
    item_ids: Vec<u64>,
}

/// Fetches the ids of the catalog page to index this cycle.
pub struct FetchCatalog;

#[async_trait]
impl Job for FetchCatalog {
    async fn run(&self, ctx: &JobContext, ct: &CancellationToken) -> anyhow::Result<JobResult> {
        if let Some(stop) = ctx.checkpoint(ct) {
            return Ok(stop);
        }
        let settings: CatalogSettings = ctx.options.settings_as().context("catalog settings")?;
        let item_ids: Vec<u64> = (1..=u64::from(settings.page_size)).collect();
        debug!(items = item_ids.len(), "catalog page fetched");
        Ok(JobResult::success_with(json!({ "item_ids": item_ids })))
    }
}

/// Renders fetched items and writes them to the index through a pipeline.
pub struct IndexCatalog {
    options: PipelineOptions,
}

impl IndexCatalog {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }

    fn pipeline(&self, item_ids: Vec<u64>) -> Pipeline {
        Pipeline::source("fetched_items", move |_ctx, _ct| {
            futures::stream::iter(item_ids.clone()).map(anyhow::Ok)
        })
        .segment("render", |ctx: SegmentContext<u64>, _ct| async move {
            anyhow::Ok((ctx.data, format!("item-{}", ctx.data)))
        })
        .sink("store", |ctx: SinkContext<(u64, String)>| async move {
            let index = ctx.services.require::<CatalogIndex>()?;
            let (id, document) = ctx.data;
            index.upsert(id, document);
            anyhow::Ok(())
        })
        .with_name("catalog_index")
        .with_options(self.options.clone())
    }
}

#[async_trait]
impl Job for IndexCatalog {
    async fn run(&self, ctx: &JobContext, ct: &CancellationToken) -> anyhow::Result<JobResult> {
        let fetched = ctx
            .dependency(&job_name::<FetchCatalog>())
            .context("fetch result missing")?;
        let page: FetchedPage = serde_json::from_value(fetched.data().clone()).context("fetch result")?;

        let args = RunArgs::new(ct.child_token())
            .with_lease(ctx.lease.clone())
            .with_services(ctx.services.clone());
        let report = self.pipeline(page.item_ids).run(args).await;

        Ok(match report.outcome {
            PipelineOutcome::Completed => JobResult::success_with(json!({
                "indexed": report.delivered,
                "dropped": report.dropped,
                "dead_lettered": report.dead_lettered,
            })),
            PipelineOutcome::Cancelled => ctx.checkpoint(ct).unwrap_or_else(JobResult::cancelled),
            PipelineOutcome::Aborted => JobResult::failure(report.error.unwrap_or_else(|| "pipeline aborted".into())),
        })
    }
}

/// Logs the index size; runs even when another instance holds the lease.
pub struct ReportIndexSize;

#[async_trait]
impl Job for ReportIndexSize {
    async fn run(&self, ctx: &JobContext, _ct: &CancellationToken) -> anyhow::Result<JobResult> {
        let index = ctx.services.require::<CatalogIndex>()?;
        info!(size = index.len(), leader = ctx.has_lease(), "catalog index size");
        Ok(JobResult::success_with(json!({ "size": index.len() })))
    }
}

pub fn catalog_group(config: &CatalogConfig) -> JobGroup {
    let mut options = JobGroupOptions::new(CATALOG_GROUP)
        .with_interval(config.interval())
        .with_lease(config.lease.clone())
        .with_lease_refresh_interval(config.lease_refresh_interval())
        .with_settings(json!({ "page_size": config.page_size }));
    if let Some(flag) = &config.feature_flag {
        options = options.with_feature_flag(flag.clone());
    }

    JobGroup::new(options)
        .job_default(FetchCatalog)
        .job(
            JobDescriptor::for_job::<IndexCatalog>().depends_on::<FetchCatalog>(),
            IndexCatalog::new(config.pipeline.options()),
        )
        .job(JobDescriptor::for_job::<ReportIndexSize>().run_always(), ReportIndexSize)
}

fn heartbeat_pipeline(beats: u32, every: Duration) -> Pipeline {
    Pipeline::source("ticks", move |_ctx, ct: CancellationToken| {
        IntervalStream::new(tokio::time::interval(every))
            .take(beats as usize)
            .take_until(async move { ct.cancelled().await })
            .map(|tick| anyhow::Ok(tick.elapsed()))
    })
    .sink("log", |ctx: SinkContext<Duration>| async move {
        info!(
            beat = ctx.sequence,
            trace_id = %ctx.trace.trace_id,
            lag_us = ctx.data.as_micros() as u64,
            leader = ctx.has_lease(),
            "heartbeat"
        );
        anyhow::Ok(())
    })
    .with_name("heartbeat")
}

pub fn heartbeat_group(config: &HeartbeatConfig) -> PipelineGroup {
    heartbeat_group_every(config, Duration::from_secs(1))
}

pub(crate) fn heartbeat_group_every(config: &HeartbeatConfig, beat: Duration) -> PipelineGroup {
    let mut group = PipelineGroup::new(HEARTBEAT_GROUP).with_lease_refresh_interval(config.lease_refresh_interval());
    if let Some(secs) = config.interval_secs {
        group = group.with_interval(Duration::from_secs(secs));
    }
    if let Some(flag) = &config.feature_flag {
        group = group.with_feature_flag(flag.clone());
    }

    let pipeline = heartbeat_pipeline(config.beats, beat);
    match &config.lease {
        Some(lease) => group.leased_pipeline(lease.clone(), pipeline),
        None => group.pipeline(pipeline),
    }
}
