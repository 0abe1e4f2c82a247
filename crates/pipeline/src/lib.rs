//! Pipeline engine: typed `source → segment* → sink` chains.
//!
//! ## Design
//!
//! - Each stage runs in its own task; stages are linked by bounded queues,
//!   so a slow sink throttles the source
//! - The source stamps every item with a fresh trace context and a sequence
//!   number starting at 1; downstream stages never regenerate them
//! - Failed items are retried per stage, then handled by the pipeline's
//!   `FailurePolicy`
//! - Cancellation is cooperative: an in-flight segment or sink call runs to
//!   completion, then the stage stops; the run still returns a report
//! - A panicking segment or sink call is an item failure like any other
//!
//! ## Components
//!
//! - `Pipeline` / `PipelineBuilder`: typed chain construction and `run`
//! - `PipelineOptions` / `FailurePolicy`: queue capacity, retries, failure handling
//! - `DeadLetterQueue`: items given up on under `FailurePolicy::DeadLetter`
//! - `PipelineHost` / `PipelineGroup`: flag- and lease-gated recurring runs

pub mod context;
pub mod dead_letter;
pub mod error;
pub mod group;
pub mod host;
pub mod message;
pub mod options;
pub mod pipeline;
mod stage;

pub use context::{SegmentContext, SinkContext, SourceContext};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use error::PipelineError;
pub use group::{HostedPipeline, PipelineGroup};
pub use host::{PipelineHost, PipelineHostBuilder, PipelineHostHandle, PipelineRunOutcome, PipelineRunRecord};
pub use message::PipelineMessage;
pub use options::{FailurePolicy, PipelineOptions};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutcome, PipelineReport, RunArgs};
