//! Trace correlation carried with every pipeline item.

use serde::{Deserialize, Serialize};

use crate::id::{SpanId, TraceId};

/// Correlation context attached to an item at its emission point.
///
/// `trace_id` never changes once created; `span_id` identifies the span that
/// emitted the item and is used as the parent of downstream stage spans.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl TraceContext {
    /// Start a new trace rooted at a fresh span.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
        }
    }
}
