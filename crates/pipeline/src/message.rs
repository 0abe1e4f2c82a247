//! Items flowing between pipeline stages.

use tracing::Span;

use conductor_core::TraceContext;

/// One item in flight, together with its correlation data.
///
/// `trace` is created by the source and never regenerated downstream.
/// `sequence` counts items emitted by the source in one run, starting at 1.
#[derive(Debug, Clone)]
pub struct PipelineMessage<T> {
    pub data: T,
    pub trace: TraceContext,
    pub sequence: u64,
    /// Span opened by the source for this item; parent of every stage span.
    pub(crate) span: Span,
}

impl<T> PipelineMessage<T> {
    pub(crate) fn new(data: T, trace: TraceContext, sequence: u64, span: Span) -> Self {
        Self {
            data,
            trace,
            sequence,
            span,
        }
    }

    /// Carry the correlation data over to a transformed payload.
    pub(crate) fn map<O>(self, data: O) -> PipelineMessage<O> {
        PipelineMessage {
            data,
            trace: self.trace,
            sequence: self.sequence,
            span: self.span,
        }
    }
}
