//! Typed lease manager.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use conductor_core::LeaseToken;

use crate::backend::LeaseBackend;
use crate::error::LeaseError;
use crate::memory::InMemoryLeaseBackend;

/// Lease manager runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeaseStats {
    pub acquired: u64,
    pub contended: u64,
    pub released: u64,
    pub refreshed: u64,
    pub lost: u64,
}

/// Outcome of one acquisition attempt.
///
/// Owned by the caller. A result that still holds the lease when dropped is
/// released through the backend's best-effort `abandon` path and a warning is
/// logged; call [`LeaseManager::release`] explicitly on the normal path.
pub struct LeaseResult<T> {
    name: String,
    token: Option<LeaseToken>,
    payload: Option<T>,
    backend: Arc<dyn LeaseBackend>,
}

impl<T> LeaseResult<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this result currently owns the lease.
    pub fn has_lease(&self) -> bool {
        self.token.is_some()
    }

    /// Last published payload (also visible when the lease was not acquired).
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn token(&self) -> Option<LeaseToken> {
        self.token
    }
}

impl<T> Drop for LeaseResult<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            warn!(lease = %self.name, "lease dropped while held; releasing");
            self.backend.abandon(&self.name, token);
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for LeaseResult<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaseResult")
            .field("name", &self.name)
            .field("has_lease", &self.has_lease())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Front door for acquiring, updating and releasing named leases.
///
/// Cheap to clone; clones share the backend and the statistics.
#[derive(Clone)]
pub struct LeaseManager {
    backend: Arc<dyn LeaseBackend>,
    stats: Arc<Mutex<LeaseStats>>,
}

impl LeaseManager {
    pub fn new<B>(backend: B) -> Self
    where
        B: LeaseBackend + 'static,
    {
        Self {
            backend: Arc::new(backend),
            stats: Arc::new(Mutex::new(LeaseStats::default())),
        }
    }

    /// Manager over a fresh in-memory backend without expiry.
    pub fn in_memory() -> Self {
        Self::new(InMemoryLeaseBackend::new())
    }

    /// Try to take the lease without waiting.
    ///
    /// Contention is not an error: the result reports `has_lease() == false`
    /// and carries the last published payload.
    pub async fn try_acquire_non_blocking<T>(&self, name: &str) -> Result<LeaseResult<T>, LeaseError>
    where
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let acquisition = self.backend.try_acquire(name).await?;

        let mut result = LeaseResult {
            name: name.to_string(),
            token: acquisition.token,
            payload: None,
            backend: self.backend.clone(),
        };

        if let Some(raw) = acquisition.payload {
            match serde_json::from_value::<T>(raw) {
                Ok(payload) => result.payload = Some(payload),
                Err(source) => {
                    if let Some(token) = result.token.take() {
                        self.backend.release(name, token).await?;
                    }
                    return Err(LeaseError::Payload {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if result.has_lease() {
            self.bump(|s| s.acquired += 1);
            info!(lease = name, elapsed_ms, "lease acquired");
        } else {
            self.bump(|s| s.contended += 1);
            debug!(lease = name, elapsed_ms, "lease held elsewhere");
        }

        Ok(result)
    }

    /// Publish a new payload for a held lease.
    pub async fn put<T>(&self, result: &mut LeaseResult<T>, data: T) -> Result<(), LeaseError>
    where
        T: Serialize,
    {
        let token = result
            .token
            .ok_or_else(|| LeaseError::NotHeld(result.name.clone()))?;

        let started = Instant::now();
        let raw = serde_json::to_value(&data).map_err(|source| LeaseError::Payload {
            name: result.name.clone(),
            source,
        })?;

        match self.backend.put(&result.name, token, raw).await {
            Ok(()) => {
                result.payload = Some(data);
                debug!(
                    lease = %result.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "lease payload updated"
                );
                Ok(())
            }
            Err(err) if err.is_lost() => {
                result.token = None;
                self.bump(|s| s.lost += 1);
                warn!(lease = %result.name, "lease lost before payload update");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Free the lease. Releasing twice, or releasing a result that never held
    /// the lease, is a no-op.
    pub async fn release<T>(&self, result: &mut LeaseResult<T>) -> Result<(), LeaseError> {
        let Some(token) = result.token.take() else {
            return Ok(());
        };

        let started = Instant::now();
        self.backend.release(&result.name, token).await?;
        self.bump(|s| s.released += 1);
        info!(
            lease = %result.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lease released"
        );
        Ok(())
    }

    /// Extend ownership of a held lease.
    ///
    /// Returns `false` and clears the result's ownership when the lease was lost.
    pub async fn refresh<T>(&self, result: &mut LeaseResult<T>) -> Result<bool, LeaseError> {
        let token = result
            .token
            .ok_or_else(|| LeaseError::NotHeld(result.name.clone()))?;

        let started = Instant::now();
        let still_held = self.backend.refresh(&result.name, token).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if still_held {
            self.bump(|s| s.refreshed += 1);
            debug!(lease = %result.name, elapsed_ms, "lease refreshed");
        } else {
            result.token = None;
            self.bump(|s| s.lost += 1);
            warn!(lease = %result.name, elapsed_ms, "lease lost on refresh");
        }

        Ok(still_held)
    }

    /// Current manager statistics.
    pub fn stats(&self) -> LeaseStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn bump(&self, f: impl FnOnce(&mut LeaseStats)) {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl core::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SyncCursor {
        page: u32,
    }

    #[tokio::test]
    async fn held_lease_round_trips_typed_payload() {
        let manager = LeaseManager::in_memory();

        let mut first = manager
            .try_acquire_non_blocking::<SyncCursor>("parties")
            .await
            .unwrap();
        assert!(first.has_lease());
        assert!(first.payload().is_none());

        manager.put(&mut first, SyncCursor { page: 3 }).await.unwrap();
        manager.release(&mut first).await.unwrap();

        let second = manager
            .try_acquire_non_blocking::<SyncCursor>("parties")
            .await
            .unwrap();
        assert_eq!(second.payload(), Some(&SyncCursor { page: 3 }));
    }

    #[tokio::test]
    async fn put_without_lease_is_invalid_operation() {
        let manager = LeaseManager::in_memory();
        let mut holder = manager.try_acquire_non_blocking::<u32>("roles").await.unwrap();
        let mut other = manager.try_acquire_non_blocking::<u32>("roles").await.unwrap();

        assert!(!other.has_lease());
        let err = manager.put(&mut other, 1).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotHeld(_)));
        assert!(err.to_string().contains("invalid operation"));

        manager.release(&mut holder).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = LeaseManager::in_memory();
        let mut lease = manager.try_acquire_non_blocking::<()>("resources").await.unwrap();

        manager.release(&mut lease).await.unwrap();
        manager.release(&mut lease).await.unwrap();

        assert!(!lease.has_lease());
        assert_eq!(manager.stats().released, 1);
    }

    #[tokio::test]
    async fn refresh_without_ttl_reports_true() {
        let manager = LeaseManager::in_memory();
        let mut lease = manager.try_acquire_non_blocking::<()>("roles").await.unwrap();

        assert!(manager.refresh(&mut lease).await.unwrap());
        assert_eq!(manager.stats().refreshed, 1);
        manager.release(&mut lease).await.unwrap();
    }

    #[tokio::test]
    async fn stats_count_contention() {
        let manager = LeaseManager::in_memory();
        let mut a = manager.try_acquire_non_blocking::<()>("x").await.unwrap();
        let b = manager.try_acquire_non_blocking::<()>("x").await.unwrap();

        assert!(!b.has_lease());
        let stats = manager.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.contended, 1);

        manager.release(&mut a).await.unwrap();
    }
}
