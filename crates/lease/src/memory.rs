//! In-memory lease backend for tests/dev and single-instance deployments.
//!
//! Lease names are never evicted: the slot map is a cache for the lifetime of
//! the backend instance. That is fine for a bounded, known set of job-group and
//! pipeline names; dynamic names would need an eviction policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use conductor_core::LeaseToken;

use crate::backend::{Acquisition, LeaseBackend};
use crate::error::LeaseError;

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: LeaseToken,
    expires_at: Option<Instant>,
}

impl Holder {
    fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct LeaseSlot {
    holder: Option<Holder>,
    payload: Option<JsonValue>,
}

impl LeaseSlot {
    fn owned_by(&self, token: LeaseToken) -> bool {
        self.holder.is_some_and(|h| h.token == token)
    }
}

/// In-memory lease store.
///
/// Each lease name has its own mutex; the outer map lock is only held long
/// enough to resolve a name to its slot, so operations on different names
/// never contend on slot state.
#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    slots: Mutex<HashMap<String, Arc<Mutex<LeaseSlot>>>>,
    ttl: Option<Duration>,
}

impl InMemoryLeaseBackend {
    /// Leases never expire; they are held until released.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases expire `ttl` after acquisition or the last refresh.
    ///
    /// An expired lease stays with its holder until somebody else acquires it.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Forcibly free a lease regardless of holder (operator/test hook).
    pub fn revoke(&self, name: &str) -> Result<(), LeaseError> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;
        slot.holder = None;
        Ok(())
    }

    /// Whether a holder currently has the lease.
    pub fn is_held(&self, name: &str) -> bool {
        let Ok(slot) = self.slot(name) else {
            return false;
        };
        slot.lock()
            .map(|s| s.holder.is_some_and(|h| h.is_active(Instant::now())))
            .unwrap_or(false)
    }

    fn slot(&self, name: &str) -> Result<Arc<Mutex<LeaseSlot>>, LeaseError> {
        let mut slots = self.slots.lock().map_err(|_| LeaseError::Poisoned)?;
        Ok(slots.entry(name.to_string()).or_default().clone())
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }

    fn release_sync(&self, name: &str, token: LeaseToken) -> Result<(), LeaseError> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;
        if slot.owned_by(token) {
            slot.holder = None;
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn try_acquire(&self, name: &str) -> Result<Acquisition, LeaseError> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;

        let taken = slot.holder.is_some_and(|h| h.is_active(Instant::now()));
        if taken {
            return Ok(Acquisition {
                token: None,
                payload: slot.payload.clone(),
            });
        }

        let token = LeaseToken::new();
        slot.holder = Some(Holder {
            token,
            expires_at: self.expiry(),
        });

        Ok(Acquisition {
            token: Some(token),
            payload: slot.payload.clone(),
        })
    }

    async fn put(&self, name: &str, token: LeaseToken, payload: JsonValue) -> Result<(), LeaseError> {
        let slot = self.slot(name)?;
        let mut slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;
        if !slot.owned_by(token) {
            return Err(LeaseError::Lost(name.to_string()));
        }
        slot.payload = Some(payload);
        Ok(())
    }

    async fn release(&self, name: &str, token: LeaseToken) -> Result<(), LeaseError> {
        self.release_sync(name, token)
    }

    async fn refresh(&self, name: &str, token: LeaseToken) -> Result<bool, LeaseError> {
        if self.ttl.is_none() {
            let slot = self.slot(name)?;
            let slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;
            return Ok(slot.owned_by(token));
        }

        let expires_at = self.expiry();
        let slot = self.slot(name)?;
        let mut slot = slot.lock().map_err(|_| LeaseError::Poisoned)?;
        match slot.holder.as_mut() {
            Some(holder) if holder.token == token => {
                holder.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn abandon(&self, name: &str, token: LeaseToken) {
        if let Err(err) = self.release_sync(name, token) {
            tracing::warn!(lease = name, error = %err, "failed to release abandoned lease");
        }
    }
}
