//! Lease storage port.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use conductor_core::LeaseToken;

use crate::error::LeaseError;

/// Outcome of a raw acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// `Some` iff the caller now holds the lease.
    pub token: Option<LeaseToken>,
    /// Last published payload (visible to holders and non-holders alike).
    pub payload: Option<JsonValue>,
}

/// Lease storage abstraction.
///
/// Any implementation (in-memory, blob lease, database row lock) must honour:
///
/// - `try_acquire` never waits for another holder to finish
/// - at most one outstanding token per lease name
/// - `put`/`release`/`refresh` act only when the supplied token still owns the lease
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Try to take the lease without waiting.
    async fn try_acquire(&self, name: &str) -> Result<Acquisition, LeaseError>;

    /// Publish a payload. Fails with `LeaseError::Lost` when `token` no longer owns the lease.
    async fn put(&self, name: &str, token: LeaseToken, payload: JsonValue) -> Result<(), LeaseError>;

    /// Free the lease. Releasing a token that no longer owns the lease is a no-op.
    async fn release(&self, name: &str, token: LeaseToken) -> Result<(), LeaseError>;

    /// Extend ownership. Returns `false` when the lease was lost.
    async fn refresh(&self, name: &str, token: LeaseToken) -> Result<bool, LeaseError>;

    /// Synchronous best-effort release, used when a held `LeaseResult` is dropped.
    ///
    /// Backends that cannot release without IO may leave the lease to expire.
    fn abandon(&self, name: &str, token: LeaseToken);
}

#[async_trait]
impl<B> LeaseBackend for Arc<B>
where
    B: LeaseBackend + ?Sized,
{
    async fn try_acquire(&self, name: &str) -> Result<Acquisition, LeaseError> {
        (**self).try_acquire(name).await
    }

    async fn put(&self, name: &str, token: LeaseToken, payload: JsonValue) -> Result<(), LeaseError> {
        (**self).put(name, token, payload).await
    }

    async fn release(&self, name: &str, token: LeaseToken) -> Result<(), LeaseError> {
        (**self).release(name, token).await
    }

    async fn refresh(&self, name: &str, token: LeaseToken) -> Result<bool, LeaseError> {
        (**self).refresh(name, token).await
    }

    fn abandon(&self, name: &str, token: LeaseToken) {
        (**self).abandon(name, token)
    }
}
