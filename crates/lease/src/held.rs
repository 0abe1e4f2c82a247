//! Shareable keeper for an acquired lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LeaseError;
use crate::manager::{LeaseManager, LeaseResult};

/// Default interval between background refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// An acquired lease shared between a scheduler and the jobs it runs.
///
/// Payloads are stored as JSON and decoded per call, so jobs of one group can
/// read and publish their own payload types through the same lease.
pub struct HeldLease {
    manager: LeaseManager,
    inner: Mutex<LeaseResult<JsonValue>>,
    lost: AtomicBool,
}

impl HeldLease {
    /// Wrap a lease result. Returns `None` if the result does not hold the lease.
    pub fn new(manager: LeaseManager, result: LeaseResult<JsonValue>) -> Option<Arc<Self>> {
        if !result.has_lease() {
            return None;
        }
        Some(Arc::new(Self {
            manager,
            inner: Mutex::new(result),
            lost: AtomicBool::new(false),
        }))
    }

    /// Acquire `name` without waiting. `Ok(None)` means the lease is held elsewhere.
    pub async fn acquire(manager: &LeaseManager, name: &str) -> Result<Option<Arc<Self>>, LeaseError> {
        let result = manager.try_acquire_non_blocking::<JsonValue>(name).await?;
        Ok(Self::new(manager.clone(), result))
    }

    pub async fn name(&self) -> String {
        self.inner.lock().await.name().to_string()
    }

    /// `false` once the lease was lost or released.
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::Acquire)
    }

    /// Decode the current payload as `T`.
    pub async fn payload<T>(&self) -> Result<Option<T>, LeaseError>
    where
        T: DeserializeOwned,
    {
        let guard = self.inner.lock().await;
        match guard.payload() {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|source| LeaseError::Payload {
                    name: guard.name().to_string(),
                    source,
                }),
        }
    }

    /// Publish a payload. Marks the lease lost if the backend reports loss.
    pub async fn put<T>(&self, data: &T) -> Result<(), LeaseError>
    where
        T: Serialize,
    {
        let mut guard = self.inner.lock().await;
        let raw = serde_json::to_value(data).map_err(|source| LeaseError::Payload {
            name: guard.name().to_string(),
            source,
        })?;
        let result = self.manager.put(&mut *guard, raw).await;
        if !guard.has_lease() {
            self.lost.store(true, Ordering::Release);
        }
        result
    }

    /// Extend ownership once. Returns `false` when the lease was lost.
    pub async fn refresh(&self) -> Result<bool, LeaseError> {
        let mut guard = self.inner.lock().await;
        if !guard.has_lease() {
            return Ok(false);
        }
        let still_held = self.manager.refresh(&mut *guard).await?;
        if !still_held {
            self.lost.store(true, Ordering::Release);
        }
        Ok(still_held)
    }

    /// Release the lease. Idempotent.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let mut guard = self.inner.lock().await;
        self.lost.store(true, Ordering::Release);
        self.manager.release(&mut *guard).await
    }

    /// Refresh the lease every `every` until stopped.
    ///
    /// When the lease is lost, it is flagged and `on_lost` is cancelled.
    pub fn spawn_refresher(self: &Arc<Self>, every: Duration, on_lost: CancellationToken) -> RefresherHandle {
        let stop = CancellationToken::new();
        let held = self.clone();
        let stop_rx = stop.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match held.refresh().await {
                    Ok(true) => debug!("lease refresher tick"),
                    Ok(false) => {
                        warn!("lease lost; cancelling holder");
                        on_lost.cancel();
                        break;
                    }
                    Err(err) if err.is_lost() => {
                        held.lost.store(true, Ordering::Release);
                        on_lost.cancel();
                        break;
                    }
                    Err(err) => warn!(error = %err, "lease refresh failed"),
                }
            }
        });

        RefresherHandle {
            stop,
            join: Some(join),
        }
    }
}

impl core::fmt::Debug for HeldLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeldLease")
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

/// Handle to a running background refresher. Dropping it stops the task.
#[derive(Debug)]
pub struct RefresherHandle {
    stop: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl RefresherHandle {
    /// Stop refreshing and wait for the task to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLeaseBackend;
    use serde_json::json;

    #[tokio::test]
    async fn acquire_returns_none_under_contention() {
        let manager = LeaseManager::in_memory();
        let first = HeldLease::acquire(&manager, "parties").await.unwrap();
        assert!(first.is_some());

        let second = HeldLease::acquire(&manager, "parties").await.unwrap();
        assert!(second.is_none());

        first.unwrap().release().await.unwrap();
        assert!(HeldLease::acquire(&manager, "parties").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn payload_is_decoded_per_call() {
        let manager = LeaseManager::in_memory();
        let held = HeldLease::acquire(&manager, "roles").await.unwrap().unwrap();

        held.put(&json!({"page": 7})).await.unwrap();
        let page: Option<JsonValue> = held.payload().await.unwrap();
        assert_eq!(page, Some(json!({"page": 7})));

        let err = held.payload::<u64>().await.unwrap_err();
        assert!(matches!(err, LeaseError::Payload { .. }));
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_cancels_token_when_lease_is_revoked() {
        let backend = Arc::new(InMemoryLeaseBackend::with_ttl(Duration::from_secs(60)));
        let manager = LeaseManager::new(backend.clone());
        let held = HeldLease::acquire(&manager, "resources").await.unwrap().unwrap();

        let on_lost = CancellationToken::new();
        let refresher = held.spawn_refresher(Duration::from_secs(1), on_lost.clone());

        backend.revoke("resources").unwrap();
        tokio::time::timeout(Duration::from_secs(5), on_lost.cancelled())
            .await
            .unwrap();

        assert!(!held.is_held());
        refresher.stop().await;
    }
}
