//! End-to-end pipeline runs: ordering, failure policies, backpressure, tracing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use conductor_core::{RetryPolicy, TraceId};
use conductor_pipeline::{
    FailurePolicy, Pipeline, PipelineOptions, PipelineOutcome, RunArgs, SegmentContext, SinkContext, SourceContext,
};

type Collected<T> = Arc<Mutex<Vec<T>>>;
type Numbers = tokio_stream::Iter<std::vec::IntoIter<anyhow::Result<i64>>>;

fn numbers(items: Vec<i64>) -> impl Fn(SourceContext, CancellationToken) -> Numbers + Send + Sync + 'static {
    move |_ctx, _ct| tokio_stream::iter(items.iter().copied().map(Ok).collect::<Vec<_>>())
}

/// Doubles every item except `poison`, which always fails.
fn doubling_into(poison: Option<i64>, out: Collected<i64>) -> Pipeline {
    Pipeline::source("numbers", numbers(vec![1, 2, 3]))
        .segment("double", move |ctx: SegmentContext<i64>, _ct| async move {
            if Some(ctx.data) == poison {
                return Err(anyhow!("cannot double {}", ctx.data));
            }
            anyhow::Ok(ctx.data * 2)
        })
        .sink("collect", move |ctx: SinkContext<i64>| {
            let out = out.clone();
            async move {
                out.lock().unwrap().push(ctx.data);
                anyhow::Ok(())
            }
        })
}

#[tokio::test]
async fn items_flow_through_every_stage_in_order() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(None, out.clone());

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(*out.lock().unwrap(), vec![2, 4, 6]);
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.emitted, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.dropped, 0);
    assert!(report.error.is_none());
    assert_eq!(pipeline.stages(), ["numbers", "double", "collect"]);
    assert_eq!(pipeline.name(), "numbers");
}

#[tokio::test]
async fn a_pipeline_can_run_again() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(None, out.clone()).with_name("doubler");

    let first = pipeline.run(RunArgs::default()).await;
    let second = pipeline.run(RunArgs::default()).await;

    assert_eq!(first.pipeline, "doubler");
    assert_eq!(second.outcome, PipelineOutcome::Completed);
    assert_eq!(*out.lock().unwrap(), vec![2, 4, 6, 2, 4, 6]);
}

#[tokio::test]
async fn failed_item_is_dropped_and_the_rest_continue() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(Some(2), out.clone());

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(*out.lock().unwrap(), vec![2, 6]);
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 2);
    assert!(pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn failed_item_is_dead_lettered() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(Some(2), out.clone())
        .with_options(PipelineOptions::default().with_failure_policy(FailurePolicy::DeadLetter));

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(*out.lock().unwrap(), vec![2, 6]);
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.dropped, 0);

    let entries = pipeline.dead_letters().drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pipeline, "numbers");
    assert_eq!(entries[0].stage, "double");
    assert_eq!(entries[0].sequence, 2);
    assert_eq!(entries[0].attempts, 1);
    assert!(entries[0].error.contains("cannot double 2"));
    assert!(pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn abort_chain_stops_the_run() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(Some(2), out.clone())
        .with_options(PipelineOptions::default().with_failure_policy(FailurePolicy::AbortChain));

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.outcome, PipelineOutcome::Aborted);
    let error = report.error.expect("abort reason");
    assert!(error.contains("double"), "{error}");
    assert!(error.contains("cannot double 2"), "{error}");
    assert!(!out.lock().unwrap().contains(&6));
}

#[tokio::test]
async fn sink_failures_follow_the_policy_too() {
    let pipeline = Pipeline::source("numbers", numbers(vec![1, 2, 3, 4]))
        .sink("odd_only", |ctx: SinkContext<i64>| async move {
            if ctx.data % 2 == 0 {
                return Err(anyhow!("even"));
            }
            anyhow::Ok(())
        })
        .with_options(PipelineOptions::default().with_failure_policy(FailurePolicy::DeadLetter));

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.dead_lettered, 2);
    let stages: Vec<_> = pipeline.dead_letters().entries().into_iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec!["odd_only", "odd_only"]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let out: Collected<i64> = Arc::default();
    let sink_out = out.clone();
    let seen = calls.clone();

    let pipeline = Pipeline::source("numbers", numbers(vec![5]))
        .segment_with_retry(
            "flaky",
            RetryPolicy::fixed(3, Duration::from_millis(100)),
            move |ctx: SegmentContext<i64>, _ct| {
                let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        return Err(anyhow!("attempt {attempt} failed"));
                    }
                    anyhow::Ok(ctx.data + 1)
                }
            },
        )
        .sink("collect", move |ctx: SinkContext<i64>| {
            let out = sink_out.clone();
            async move {
                out.lock().unwrap().push(ctx.data);
                anyhow::Ok(())
            }
        });

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*out.lock().unwrap(), vec![6]);
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_attempt_limit() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let pipeline = Pipeline::source("numbers", numbers(vec![5]))
        .sink("down", move |_ctx: SinkContext<i64>| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow!("still down")) }
        })
        .with_options(
            PipelineOptions::default()
                .with_retry(RetryPolicy::exponential(4, Duration::from_millis(10), Duration::from_secs(1)))
                .with_failure_policy(FailurePolicy::DeadLetter),
        );

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(pipeline.dead_letters().entries()[0].attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn slow_sink_throttles_the_source() {
    const ITEMS: i64 = 6;
    const SINK_DELAY: Duration = Duration::from_millis(50);

    let produced = Arc::new(AtomicU64::new(0));
    let max_lead = Arc::new(AtomicU64::new(0));

    let counter = produced.clone();
    let lead = max_lead.clone();
    let sink_counter = produced.clone();

    let pipeline = Pipeline::source("counter", move |_ctx, _ct| {
        let counter = counter.clone();
        futures::stream::iter(1..=ITEMS).map(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(n)
        })
    })
    .sink("slow", move |ctx: SinkContext<i64>| {
        let produced = sink_counter.load(Ordering::SeqCst);
        lead.fetch_max(produced - ctx.sequence, Ordering::SeqCst);
        async move {
            tokio::time::sleep(SINK_DELAY).await;
            anyhow::Ok(())
        }
    })
    .with_options(PipelineOptions::default().with_capacity(1));

    let started = Instant::now();
    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.delivered, ITEMS as u64);
    assert!(started.elapsed() >= SINK_DELAY * ITEMS as u32);
    // One item queued plus one held by the source waiting to send.
    assert!(max_lead.load(Ordering::SeqCst) <= 2, "lead {}", max_lead.load(Ordering::SeqCst));
}

#[tokio::test]
async fn zero_capacity_is_treated_as_one() {
    let out: Collected<i64> = Arc::default();
    let pipeline = doubling_into(None, out.clone()).with_options(PipelineOptions::default().with_capacity(0));

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(*out.lock().unwrap(), vec![2, 4, 6]);
}

#[tokio::test]
async fn trace_context_and_sequence_follow_each_item() {
    let at_segment: Collected<(u64, TraceId)> = Arc::default();
    let at_sink: Collected<(u64, TraceId)> = Arc::default();
    let seg = at_segment.clone();
    let sink = at_sink.clone();

    let pipeline = Pipeline::source("numbers", numbers(vec![10, 20, 30, 40]))
        .segment("tag", move |ctx: SegmentContext<i64>, _ct| {
            seg.lock().unwrap().push((ctx.sequence, ctx.trace.trace_id));
            async move { anyhow::Ok(ctx.data.to_string()) }
        })
        .sink("record", move |ctx: SinkContext<String>| {
            sink.lock().unwrap().push((ctx.sequence, ctx.trace.trace_id));
            async { anyhow::Ok(()) }
        });

    pipeline.run(RunArgs::default()).await;

    let at_segment = at_segment.lock().unwrap().clone();
    let at_sink = at_sink.lock().unwrap().clone();
    assert_eq!(at_segment, at_sink);
    let sequences: Vec<u64> = at_sink.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    let trace_ids: HashSet<TraceId> = at_sink.iter().map(|(_, t)| *t).collect();
    assert_eq!(trace_ids.len(), 4);
}

#[tokio::test]
async fn empty_source_completes() {
    let empty = Pipeline::source("nothing", numbers(Vec::new()))
        .sink("never", |_ctx: SinkContext<i64>| async { anyhow::Ok(()) })
        .run(RunArgs::default())
        .await;
    assert_eq!(empty.outcome, PipelineOutcome::Completed);
    assert_eq!(empty.emitted, 0);
    assert_eq!(empty.delivered, 0);
}

#[tokio::test]
async fn source_error_completes_the_run() {
    let out: Collected<i64> = Arc::default();
    let sink_out = out.clone();
    let pipeline = Pipeline::source("broken", |_ctx, _ct| {
        tokio_stream::iter(vec![Ok(1), Ok(2), Err(anyhow!("connection reset")), Ok(3)])
    })
    .sink("collect", move |ctx: SinkContext<i64>| {
        let out = sink_out.clone();
        async move {
            out.lock().unwrap().push(ctx.data);
            anyhow::Ok(())
        }
    });

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(*out.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn cancellation_stops_an_endless_source() {
    let delivered = Arc::new(AtomicU64::new(0));
    let count = delivered.clone();
    let pipeline = Pipeline::source("endless", |_ctx, _ct| {
        futures::stream::unfold(0i64, |n| async move { Some((anyhow::Ok(n), n + 1)) })
    })
    .sink("slow", move |_ctx: SinkContext<i64>| {
        count.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            anyhow::Ok(())
        }
    })
    .with_options(PipelineOptions::default().with_capacity(4));

    let ct = CancellationToken::new();
    let run = {
        let pipeline = pipeline.clone();
        let ct = ct.clone();
        tokio::spawn(async move { pipeline.run(RunArgs::new(ct)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    ct.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run stops promptly")
        .unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Cancelled);
    assert!(report.error.is_none());
    assert!(delivered.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn already_cancelled_token_runs_nothing() {
    let ct = CancellationToken::new();
    ct.cancel();
    let out: Collected<i64> = Arc::default();

    let report = doubling_into(None, out.clone()).run(RunArgs::new(ct)).await;

    assert_eq!(report.outcome, PipelineOutcome::Cancelled);
    assert!(out.lock().unwrap().is_empty());
}

#[tokio::test]
async fn segments_see_the_cancellation_token() {
    let ct = CancellationToken::new();
    let pipeline = Pipeline::source("numbers", numbers(vec![1]))
        .segment("waits", |_ctx: SegmentContext<i64>, ct: CancellationToken| async move {
            ct.cancelled().await;
            Err::<i64, _>(anyhow!("cancelled"))
        })
        .sink("never", |_ctx: SinkContext<i64>| async { anyhow::Ok(()) });

    let run = {
        let ct = ct.clone();
        tokio::spawn(async move { pipeline.run(RunArgs::new(ct)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ct.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Cancelled);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_an_in_flight_sink_finish() {
    let writes: Collected<&'static str> = Arc::default();
    let sink_writes = writes.clone();
    let pipeline = Pipeline::source("numbers", numbers(vec![1, 2, 3])).sink(
        "two_step_write",
        move |_ctx: SinkContext<i64>| {
            let writes = sink_writes.clone();
            async move {
                writes.lock().unwrap().push("header");
                tokio::time::sleep(Duration::from_millis(100)).await;
                writes.lock().unwrap().push("body");
                anyhow::Ok(())
            }
        },
    );

    let ct = CancellationToken::new();
    let run = {
        let ct = ct.clone();
        tokio::spawn(async move { pipeline.run(RunArgs::new(ct)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    ct.cancel();

    let report = run.await.unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Cancelled);
    assert_eq!(report.delivered, 1);
    assert_eq!(*writes.lock().unwrap(), vec!["header", "body"]);
}

#[tokio::test]
async fn panicking_segment_drops_only_that_item() {
    let out: Collected<i64> = Arc::default();
    let sink_out = out.clone();
    let pipeline = Pipeline::source("numbers", numbers(vec![1, 2, 3]))
        .segment("double", |ctx: SegmentContext<i64>, _ct| async move {
            if ctx.data == 2 {
                panic!("bad item");
            }
            anyhow::Ok(ctx.data * 2)
        })
        .sink("collect", move |ctx: SinkContext<i64>| {
            let out = sink_out.clone();
            async move {
                out.lock().unwrap().push(ctx.data);
                anyhow::Ok(())
            }
        });

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(*out.lock().unwrap(), vec![2, 6]);
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.dropped, 1);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn panicking_sink_is_dead_lettered() {
    let pipeline = Pipeline::source("numbers", numbers(vec![1, 2, 3]))
        .sink("fragile", |ctx: SinkContext<i64>| async move {
            if ctx.data == 3 {
                panic!("sink blew up on {}", ctx.data);
            }
            anyhow::Ok(())
        })
        .with_options(PipelineOptions::default().with_failure_policy(FailurePolicy::DeadLetter));

    let report = pipeline.run(RunArgs::default()).await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.delivered, 2);
    let entries = pipeline.dead_letters().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sequence, 3);
    assert!(entries[0].error.contains("sink blew up on 3"), "{}", entries[0].error);
}
