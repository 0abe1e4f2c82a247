//! Feature-flag port used to gate job groups, jobs and pipeline groups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

/// Feature-flag lookup.
///
/// Implementations may call out to a remote flag service, hence async.
/// Unknown flags must evaluate to `false`.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(&self, flag: &str) -> bool;
}

#[async_trait]
impl<F> FeatureFlags for Arc<F>
where
    F: FeatureFlags + ?Sized,
{
    async fn is_enabled(&self, flag: &str) -> bool {
        (**self).is_enabled(flag).await
    }
}

/// Flag source that enables everything (no flag service configured).
#[derive(Debug, Default, Copy, Clone)]
pub struct AlwaysEnabled;

#[async_trait]
impl FeatureFlags for AlwaysEnabled {
    async fn is_enabled(&self, _flag: &str) -> bool {
        true
    }
}

/// In-memory flags for tests/dev and static configuration.
#[derive(Debug, Default)]
pub struct InMemoryFeatureFlags {
    flags: RwLock<HashMap<String, bool>>,
}

impl InMemoryFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(self, flag: impl Into<String>, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }

    pub fn set(&self, flag: impl Into<String>, enabled: bool) {
        let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
        flags.insert(flag.into(), enabled);
    }
}

#[async_trait]
impl FeatureFlags for InMemoryFeatureFlags {
    async fn is_enabled(&self, flag: &str) -> bool {
        let flags = self.flags.read().unwrap_or_else(|e| e.into_inner());
        flags.get(flag).copied().unwrap_or(false)
    }
}
