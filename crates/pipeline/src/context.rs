//! Contexts handed to stage functions.

use std::sync::Arc;

use conductor_core::{ServiceScope, TraceContext};
use conductor_lease::HeldLease;

/// Run-wide data shared by every stage of one pipeline run.
#[derive(Debug, Clone)]
pub(crate) struct StageEnv {
    pub(crate) pipeline: Arc<str>,
    pub(crate) stage: Arc<str>,
    pub(crate) lease: Option<Arc<HeldLease>>,
    pub(crate) services: ServiceScope,
}

/// Context for the source function, built once per run.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub pipeline: Arc<str>,
    pub stage: Arc<str>,
    pub lease: Option<Arc<HeldLease>>,
    pub services: ServiceScope,
}

impl SourceContext {
    pub(crate) fn from_env(env: &StageEnv) -> Self {
        Self {
            pipeline: env.pipeline.clone(),
            stage: env.stage.clone(),
            lease: env.lease.clone(),
            services: env.services.clone(),
        }
    }

    pub fn has_lease(&self) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_held())
    }
}

/// Context for one segment invocation.
#[derive(Debug, Clone)]
pub struct SegmentContext<I> {
    pub data: I,
    pub trace: TraceContext,
    pub sequence: u64,
    pub pipeline: Arc<str>,
    pub stage: Arc<str>,
    pub lease: Option<Arc<HeldLease>>,
    pub services: ServiceScope,
}

/// Context for one sink invocation.
#[derive(Debug, Clone)]
pub struct SinkContext<I> {
    pub data: I,
    pub trace: TraceContext,
    pub sequence: u64,
    pub pipeline: Arc<str>,
    pub stage: Arc<str>,
    pub lease: Option<Arc<HeldLease>>,
    pub services: ServiceScope,
}

macro_rules! impl_item_context {
    ($t:ident) => {
        impl<I> $t<I> {
            pub(crate) fn new(env: &StageEnv, data: I, trace: TraceContext, sequence: u64) -> Self {
                Self {
                    data,
                    trace,
                    sequence,
                    pipeline: env.pipeline.clone(),
                    stage: env.stage.clone(),
                    lease: env.lease.clone(),
                    services: env.services.clone(),
                }
            }

            pub fn has_lease(&self) -> bool {
                self.lease.as_ref().is_some_and(|l| l.is_held())
            }
        }
    };
}

impl_item_context!(SegmentContext);
impl_item_context!(SinkContext);
