use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::JobContext;
use crate::types::JobResult;

/// A unit of business work run by the scheduler once per cycle.
///
/// Both methods receive the cycle's cancellation token. Cancellation is
/// cooperative: long-running jobs should call [`JobContext::checkpoint`] at
/// their suspension points.
#[async_trait]
pub trait Job: Send + Sync {
    /// Gate evaluated right before `run`. An `Err` counts as `false`.
    ///
    /// Defaults to "all dependencies succeeded".
    async fn can_run(&self, ctx: &JobContext, _ct: &CancellationToken) -> anyhow::Result<bool> {
        Ok(ctx.dependencies_succeeded())
    }

    /// Do the work. An `Err` becomes a `Failure` result.
    async fn run(&self, ctx: &JobContext, ct: &CancellationToken) -> anyhow::Result<JobResult>;
}
