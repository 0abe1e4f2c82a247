//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use conductor_core::RetryPolicy;

use crate::dead_letter::DeadLetterQueue;

/// What happens to an item whose stage failed after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log at warn level, count the item as dropped, keep going.
    #[default]
    DropAndLog,
    /// Record the item in the dead-letter queue, keep going.
    DeadLetter,
    /// Cancel the whole chain; the run ends as `Aborted`.
    AbortChain,
}

/// Pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of every inter-stage queue.
    pub capacity: usize,
    pub failure_policy: FailurePolicy,
    /// Default retry policy for segments and the sink.
    pub retry: RetryPolicy,
    pub dead_letters: DeadLetterQueue,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::no_retry(),
            dead_letters: DeadLetterQueue::new(),
        }
    }
}

impl PipelineOptions {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letters(mut self, queue: DeadLetterQueue) -> Self {
        self.dead_letters = queue;
        self
    }
}
