//! Stage workers: one task per stage, linked by bounded queues.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use conductor_core::{RetryPolicy, TraceContext};

use crate::context::{SegmentContext, SinkContext, SourceContext, StageEnv};
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::message::PipelineMessage;
use crate::options::FailurePolicy;

pub(crate) type SourceFn<T> =
    Arc<dyn Fn(SourceContext, CancellationToken) -> BoxStream<'static, anyhow::Result<T>> + Send + Sync>;
pub(crate) type SegmentFn<I, O> =
    Arc<dyn Fn(SegmentContext<I>, CancellationToken) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;
pub(crate) type SinkFn<I> = Arc<dyn Fn(SinkContext<I>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// State shared by all stage workers of one run.
pub(crate) struct RunShared {
    pub(crate) pipeline: Arc<str>,
    pub(crate) policy: FailurePolicy,
    pub(crate) dead_letters: DeadLetterQueue,
    /// Chain token: child of the caller's token, cancelled on abort.
    pub(crate) ct: CancellationToken,
    pub(crate) emitted: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    interrupted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl RunShared {
    pub(crate) fn new(pipeline: Arc<str>, policy: FailurePolicy, dead_letters: DeadLetterQueue, ct: CancellationToken) -> Self {
        Self {
            pipeline,
            policy,
            dead_letters,
            ct,
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    /// Cancel the chain. The first reason wins.
    pub(crate) fn abort(&self, reason: String) {
        let mut slot = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.ct.cancel();
    }

    pub(crate) fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Apply the failure policy to an item. Returns `false` when the stage must stop.
    fn item_failed(&self, stage: &str, sequence: u64, trace: TraceContext, error: anyhow::Error, attempts: u32) -> bool {
        let error = format!("{error:#}");
        match self.policy {
            FailurePolicy::DropAndLog => {
                warn!(
                    pipeline = %self.pipeline,
                    stage,
                    sequence,
                    trace_id = %trace.trace_id,
                    attempts,
                    error = %error,
                    "item dropped"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            FailurePolicy::DeadLetter => {
                warn!(
                    pipeline = %self.pipeline,
                    stage,
                    sequence,
                    trace_id = %trace.trace_id,
                    attempts,
                    error = %error,
                    "item dead-lettered"
                );
                self.dead_letters.push(DeadLetterEntry {
                    pipeline: self.pipeline.to_string(),
                    stage: stage.to_string(),
                    sequence,
                    trace,
                    error,
                    attempts,
                    dead_lettered_at: Utc::now(),
                });
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                true
            }
            FailurePolicy::AbortChain => {
                error!(
                    pipeline = %self.pipeline,
                    stage,
                    sequence,
                    trace_id = %trace.trace_id,
                    attempts,
                    error = %error,
                    "item failed; aborting chain"
                );
                self.abort(format!("stage '{stage}' failed on item {sequence}: {error}"));
                false
            }
        }
    }
}

enum Attempt<O> {
    Done(O),
    Failed { error: anyhow::Error, attempts: u32 },
    Cancelled,
}

/// Invoke `call` until it succeeds or the retry policy gives up.
///
/// A call that has started always runs to completion; `ct` is checked before
/// each attempt and raced only against the backoff sleep. A failure after `ct`
/// fired counts as cancellation. A panicking call counts as a failed attempt.
async fn call_with_retry<O, F, Fut>(policy: &RetryPolicy, ct: &CancellationToken, mut call: F) -> Attempt<O>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    let mut attempt = 0;
    loop {
        if ct.is_cancelled() {
            return Attempt::Cancelled;
        }
        attempt += 1;
        let result = match AssertUnwindSafe(async { call().await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(panic_message(payload))),
        };

        match result {
            Ok(value) => return Attempt::Done(value),
            Err(_) if ct.is_cancelled() => return Attempt::Cancelled,
            Err(error) if policy.should_retry(attempt) => {
                let delay = policy.delay_after_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "stage attempt failed; retrying"
                );
                tokio::select! {
                    biased;
                    _ = ct.cancelled() => return Attempt::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Attempt::Failed { error, attempts: attempt },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("stage panicked: {s}")
    } else {
        "stage panicked".to_string()
    }
}

pub(crate) async fn run_source<T>(
    env: StageEnv,
    source: SourceFn<T>,
    tx: mpsc::Sender<PipelineMessage<T>>,
    shared: Arc<RunShared>,
) where
    T: Send + 'static,
{
    let ct = shared.ct.clone();
    let mut items = source(SourceContext::from_env(&env), ct.clone());
    let mut sequence = 0u64;

    loop {
        // The source receives `ct` and is expected to end its stream once it fires.
        if ct.is_cancelled() {
            shared.interrupt();
            break;
        }
        let data = match items.next().await {
            None => break,
            Some(Ok(data)) => data,
            Some(Err(err)) => {
                warn!(
                    pipeline = %env.pipeline,
                    stage = %env.stage,
                    error = %format!("{err:#}"),
                    "source failed; completing"
                );
                break;
            }
        };

        sequence += 1;
        let trace = TraceContext::new_root();
        let span = info_span!(
            "pipeline_item",
            pipeline = %env.pipeline,
            stage = %env.stage,
            sequence,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
        );
        let message = PipelineMessage::new(data, trace, sequence, span.clone());

        let sent = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                shared.interrupt();
                break;
            }
            r = tx.send(message).instrument(span) => r,
        };
        if sent.is_err() {
            debug!(pipeline = %env.pipeline, stage = %env.stage, "downstream closed; source stopping");
            break;
        }
        shared.emitted.fetch_add(1, Ordering::Relaxed);
    }

    debug!(pipeline = %env.pipeline, stage = %env.stage, emitted = sequence, "source completed");
}

pub(crate) async fn run_segment<I, O>(
    env: StageEnv,
    segment: SegmentFn<I, O>,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<PipelineMessage<I>>,
    tx: mpsc::Sender<PipelineMessage<O>>,
    shared: Arc<RunShared>,
) where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    let ct = shared.ct.clone();

    loop {
        let received = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                shared.interrupt();
                break;
            }
            m = rx.recv() => m,
        };
        let Some(message) = received else {
            break;
        };

        let span = info_span!(
            parent: &message.span,
            "pipeline_stage",
            pipeline = %env.pipeline,
            stage = %env.stage,
            sequence = message.sequence,
            trace_id = %message.trace.trace_id,
        );

        let attempt = call_with_retry(&retry, &ct, || {
            segment(
                SegmentContext::new(&env, message.data.clone(), message.trace, message.sequence),
                ct.clone(),
            )
        })
        .instrument(span.clone())
        .await;

        match attempt {
            Attempt::Done(out) => {
                let sent = tokio::select! {
                    biased;
                    _ = ct.cancelled() => {
                        shared.interrupt();
                        break;
                    }
                    r = tx.send(message.map(out)) => r,
                };
                if sent.is_err() {
                    debug!(pipeline = %env.pipeline, stage = %env.stage, "downstream closed; segment stopping");
                    break;
                }
            }
            Attempt::Cancelled => {
                shared.interrupt();
                break;
            }
            Attempt::Failed { error, attempts } => {
                let keep_going = span.in_scope(|| {
                    shared.item_failed(&env.stage, message.sequence, message.trace, error, attempts)
                });
                if !keep_going {
                    break;
                }
            }
        }
    }
}

pub(crate) async fn run_sink<I>(
    env: StageEnv,
    sink: SinkFn<I>,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<PipelineMessage<I>>,
    shared: Arc<RunShared>,
) where
    I: Clone + Send + Sync + 'static,
{
    let ct = shared.ct.clone();

    loop {
        let received = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                shared.interrupt();
                break;
            }
            m = rx.recv() => m,
        };
        let Some(message) = received else {
            break;
        };

        let span = info_span!(
            parent: &message.span,
            "pipeline_stage",
            pipeline = %env.pipeline,
            stage = %env.stage,
            sequence = message.sequence,
            trace_id = %message.trace.trace_id,
        );

        let attempt = call_with_retry(&retry, &ct, || {
            sink(SinkContext::new(&env, message.data.clone(), message.trace, message.sequence))
        })
        .instrument(span.clone())
        .await;

        match attempt {
            Attempt::Done(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Attempt::Cancelled => {
                shared.interrupt();
                break;
            }
            Attempt::Failed { error, attempts } => {
                let keep_going = span.in_scope(|| {
                    shared.item_failed(&env.stage, message.sequence, message.trace, error, attempts)
                });
                if !keep_going {
                    break;
                }
            }
        }
    }
}
