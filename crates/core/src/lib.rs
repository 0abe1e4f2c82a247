//! `conductor-core`: shared building blocks for the orchestration crates.
//!
//! This crate contains **no runtime machinery**: identifiers, trace context,
//! the feature-flag and service-resolution ports, and retry policy.

pub mod error;
pub mod feature;
pub mod id;
pub mod retry;
pub mod services;
pub mod trace;

pub use error::{CoreError, CoreResult};
pub use feature::{AlwaysEnabled, FeatureFlags, InMemoryFeatureFlags};
pub use id::{CycleId, LeaseToken, SpanId, TraceId};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use services::{ServiceProvider, ServiceScope};
pub use trace::TraceContext;
