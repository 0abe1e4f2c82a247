//! Dead-letter queue for items that exhausted their retries.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::TraceContext;

/// An item that failed in a stage under the `DeadLetter` policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub pipeline: String,
    pub stage: String,
    pub sequence: u64,
    pub trace: TraceContext,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Shared, append-only store of dead-lettered items.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQueue {
    entries: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: DeadLetterEntry) {
        self.lock().push(entry);
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().clone()
    }

    /// Remove and return all entries.
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence: u64) -> DeadLetterEntry {
        DeadLetterEntry {
            pipeline: "identity-export".into(),
            stage: "enrich".into(),
            sequence,
            trace: TraceContext::new_root(),
            error: "timeout".into(),
            attempts: 3,
            dead_lettered_at: Utc::now(),
        }
    }

    #[test]
    fn clones_share_entries() {
        let queue = DeadLetterQueue::new();
        let other = queue.clone();

        queue.push(entry(1));
        other.push(entry(2));

        let seqs: Vec<_> = queue.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = DeadLetterQueue::new();
        queue.push(entry(1));

        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
