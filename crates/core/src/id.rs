//! Strongly-typed identifiers used across the orchestration crates.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Fresh time-ordered (v7) id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {e}", stringify!($t))))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a distributed trace, shared by every stage an item passes through.
    TraceId
);
uuid_id!(
    /// Identifier of a single span inside a trace.
    SpanId
);
uuid_id!(
    /// Identifier of one scheduler cycle of a job group.
    CycleId
);
uuid_id!(
    /// Opaque proof of ownership handed out with a successful lease acquisition.
    ///
    /// Backends compare tokens before mutating lease state, so a holder whose
    /// lease expired cannot release or overwrite the new holder's lease.
    LeaseToken
);
