//! Named mutual-exclusion leases.
//!
//! ## Design
//!
//! - Acquisition never waits: contention is reported as `has_lease() == false`
//! - At most one unreleased acquisition per lease name
//! - Ownership is proven by a holder token, so a stale holder cannot release
//!   or overwrite a lease that has since moved on
//! - Backends are pluggable; `InMemoryLeaseBackend` is the reference
//!
//! ## Components
//!
//! - `LeaseManager`: typed front door used by schedulers and business code
//! - `LeaseBackend`: storage port (in-memory here, blob/DB leases elsewhere)
//! - `LeaseResult`: the caller-owned outcome of one acquisition attempt
//! - `HeldLease`: shareable keeper that refreshes a held lease in the background

pub mod backend;
pub mod error;
pub mod held;
pub mod manager;
pub mod memory;

pub use backend::{Acquisition, LeaseBackend};
pub use error::LeaseError;
pub use held::{HeldLease, RefresherHandle};
pub use manager::{LeaseManager, LeaseResult, LeaseStats};
pub use memory::InMemoryLeaseBackend;
