//! Typed pipeline builder and run loop.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use conductor_core::{RetryPolicy, ServiceScope};
use conductor_lease::HeldLease;

use crate::context::{SegmentContext, SinkContext, SourceContext, StageEnv};
use crate::dead_letter::DeadLetterQueue;
use crate::message::PipelineMessage;
use crate::options::PipelineOptions;
use crate::stage::{RunShared, SegmentFn, SinkFn, SourceFn, run_segment, run_sink, run_source};

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The source was exhausted and every stage drained its input.
    Completed,
    /// The caller's cancellation token fired.
    Cancelled,
    /// An item failed under `AbortChain`, or a source stream panicked.
    Aborted,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub outcome: PipelineOutcome,
    pub emitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    /// Abort reason, if any.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub ct: CancellationToken,
    pub lease: Option<Arc<HeldLease>>,
    pub services: ServiceScope,
}

impl RunArgs {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            ct,
            ..Self::default()
        }
    }

    pub fn with_lease(mut self, lease: Option<Arc<HeldLease>>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_services(mut self, services: ServiceScope) -> Self {
        self.services = services;
        self
    }
}

/// Wiring state for one run; stage closures spawn their workers into it.
pub(crate) struct ChainRun {
    shared: Arc<RunShared>,
    capacity: usize,
    retry: RetryPolicy,
    lease: Option<Arc<HeldLease>>,
    services: ServiceScope,
    tasks: Vec<JoinHandle<()>>,
}

impl ChainRun {
    fn env(&self, stage: &Arc<str>) -> StageEnv {
        StageEnv {
            pipeline: self.shared.pipeline.clone(),
            stage: stage.clone(),
            lease: self.lease.clone(),
            services: self.services.clone(),
        }
    }

    fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(worker.in_current_span()));
    }
}

type Wire<T> = Arc<dyn Fn(&mut ChainRun) -> mpsc::Receiver<PipelineMessage<T>> + Send + Sync>;

/// A partially built chain whose last stage produces `T`.
pub struct PipelineBuilder<T> {
    name: String,
    stages: Vec<String>,
    wire: Wire<T>,
}

impl<T> PipelineBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Append a transformation stage.
    pub fn segment<O, F, Fut>(self, name: impl Into<String>, f: F) -> PipelineBuilder<O>
    where
        O: Send + 'static,
        F: Fn(SegmentContext<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        self.segment_inner(name.into(), None, f)
    }

    /// Append a transformation stage with its own retry policy.
    pub fn segment_with_retry<O, F, Fut>(self, name: impl Into<String>, retry: RetryPolicy, f: F) -> PipelineBuilder<O>
    where
        O: Send + 'static,
        F: Fn(SegmentContext<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        self.segment_inner(name.into(), Some(retry), f)
    }

    /// Terminate the chain.
    pub fn sink<F, Fut>(self, name: impl Into<String>, f: F) -> Pipeline
    where
        F: Fn(SinkContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.sink_inner(name.into(), None, f)
    }

    /// Terminate the chain with a sink-specific retry policy.
    pub fn sink_with_retry<F, Fut>(self, name: impl Into<String>, retry: RetryPolicy, f: F) -> Pipeline
    where
        F: Fn(SinkContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.sink_inner(name.into(), Some(retry), f)
    }

    fn segment_inner<O, F, Fut>(mut self, name: String, retry: Option<RetryPolicy>, f: F) -> PipelineBuilder<O>
    where
        O: Send + 'static,
        F: Fn(SegmentContext<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let stage: Arc<str> = Arc::from(name.as_str());
        let segment: SegmentFn<T, O> = Arc::new(move |ctx, ct| f(ctx, ct).boxed());
        let upstream = self.wire;

        let wire: Wire<O> = Arc::new(move |run: &mut ChainRun| {
            let rx = upstream(run);
            let (tx, out) = mpsc::channel(run.capacity);
            let env = run.env(&stage);
            let retry = retry.clone().unwrap_or_else(|| run.retry.clone());
            let shared = run.shared.clone();
            run.spawn(run_segment(env, segment.clone(), retry, rx, tx, shared));
            out
        });

        self.stages.push(name);
        PipelineBuilder {
            name: self.name,
            stages: self.stages,
            wire,
        }
    }

    fn sink_inner<F, Fut>(mut self, name: String, retry: Option<RetryPolicy>, f: F) -> Pipeline
    where
        F: Fn(SinkContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let stage: Arc<str> = Arc::from(name.as_str());
        let sink: SinkFn<T> = Arc::new(move |ctx| f(ctx).boxed());
        let upstream = self.wire;

        let wire: Arc<dyn Fn(&mut ChainRun) + Send + Sync> = Arc::new(move |run: &mut ChainRun| {
            let rx = upstream(run);
            let env = run.env(&stage);
            let retry = retry.clone().unwrap_or_else(|| run.retry.clone());
            let shared = run.shared.clone();
            run.spawn(run_sink(env, sink.clone(), retry, rx, shared));
        });

        self.stages.push(name);
        Pipeline {
            name: self.name,
            stages: self.stages,
            options: PipelineOptions::default(),
            wire,
        }
    }
}

/// A complete, re-runnable `source → segment* → sink` chain.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<String>,
    options: PipelineOptions,
    wire: Arc<dyn Fn(&mut ChainRun) + Send + Sync>,
}

impl Pipeline {
    /// Start a chain. The pipeline is named after its source until renamed.
    pub fn source<T, F, S>(name: impl Into<String>, f: F) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        F: Fn(SourceContext, CancellationToken) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
    {
        let name: String = name.into();
        let stage: Arc<str> = Arc::from(name.as_str());
        let source: SourceFn<T> = Arc::new(move |ctx, ct| f(ctx, ct).boxed());

        let wire: Wire<T> = Arc::new(move |run: &mut ChainRun| {
            let (tx, rx) = mpsc::channel(run.capacity);
            let env = run.env(&stage);
            let shared = run.shared.clone();
            run.spawn(run_source(env, source.clone(), tx, shared));
            rx
        });

        PipelineBuilder {
            name: name.clone(),
            stages: vec![name],
            wire,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names, source first.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.options.dead_letters
    }

    /// Run the chain to completion, cancellation or abort.
    ///
    /// A zero queue capacity is treated as 1.
    pub async fn run(&self, args: RunArgs) -> PipelineReport {
        let started_at = Utc::now();
        let RunArgs { ct, lease, services } = args;
        let shared = Arc::new(RunShared::new(
            Arc::from(self.name.as_str()),
            self.options.failure_policy,
            self.options.dead_letters.clone(),
            ct.child_token(),
        ));

        let span = info_span!("pipeline_run", pipeline = %self.name);
        async move {
            info!(stages = self.stages.len(), capacity = self.options.capacity, "pipeline started");

            let mut chain = ChainRun {
                shared: shared.clone(),
                capacity: self.options.capacity.max(1),
                retry: self.options.retry.clone(),
                lease,
                services,
                tasks: Vec::with_capacity(self.stages.len()),
            };
            (self.wire)(&mut chain);

            for joined in join_all(chain.tasks).await {
                if let Err(err) = joined {
                    error!(error = %err, "pipeline stage task failed");
                    shared.abort(format!("stage task failed: {err}"));
                }
            }

            let error = shared.abort_reason();
            let outcome = if error.is_some() {
                PipelineOutcome::Aborted
            } else if shared.was_interrupted() {
                PipelineOutcome::Cancelled
            } else {
                PipelineOutcome::Completed
            };

            let report = PipelineReport {
                pipeline: self.name.clone(),
                outcome,
                emitted: shared.emitted.load(Ordering::Relaxed),
                delivered: shared.delivered.load(Ordering::Relaxed),
                dropped: shared.dropped.load(Ordering::Relaxed),
                dead_lettered: shared.dead_lettered.load(Ordering::Relaxed),
                error,
                started_at,
                finished_at: Utc::now(),
            };

            info!(
                outcome = ?report.outcome,
                emitted = report.emitted,
                delivered = report.delivered,
                dropped = report.dropped,
                dead_lettered = report.dead_lettered,
                "pipeline finished"
            );
            report
        }
        .instrument(span)
        .await
    }
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
