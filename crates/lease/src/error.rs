use thiserror::Error;

/// Lease operation error.
///
/// Contention is **not** an error: a failed acquisition is a normal
/// `LeaseResult` with `has_lease() == false`.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The caller tried to mutate a lease it does not hold (programming error).
    #[error("invalid operation: lease '{0}' is not held by this caller")]
    NotHeld(String),

    /// The caller held the lease, but ownership moved on (expiry or revoke).
    #[error("lease '{0}' was lost")]
    Lost(String),

    /// The stored payload could not be converted to/from the requested type.
    #[error("lease '{name}' payload does not match the requested type: {source}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Lease state lock was poisoned by a panicking holder.
    #[error("lease state lock poisoned")]
    Poisoned,

    /// Storage failure reported by a backend.
    #[error("lease backend error: {0}")]
    Backend(String),
}

impl LeaseError {
    pub fn is_lost(&self) -> bool {
        matches!(self, LeaseError::Lost(_))
    }
}
