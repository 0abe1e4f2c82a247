//! Job scheduler: recurring, lease-guarded job groups with dependency ordering.
//!
//! ## Design
//!
//! - A job group runs on its own interval; cycles of one group never overlap
//! - Each cycle takes the group lease without waiting; without it only
//!   run-always jobs execute
//! - Jobs start as soon as their dependencies finished; independent branches
//!   run concurrently
//! - A failing or panicking job becomes a `Failure` result and never aborts
//!   unrelated branches
//! - The dependency graph is validated once, at `build()`
//!
//! ## Components
//!
//! - `Job`: business contract (`can_run` gate + `run`)
//! - `JobDescriptor` / `JobGroup`: registration
//! - `JobScheduler`: cycle execution, recurring loops, report broadcast
//! - `CycleReport`: per-cycle summary with one record per job

pub mod context;
pub mod error;
pub mod graph;
pub mod group;
pub mod job;
pub mod report;
pub mod scheduler;
pub mod types;

pub use context::{DependencyResult, JobContext};
pub use error::{RegistrationError, SchedulerError};
pub use group::{JobGroup, JobGroupOptions};
pub use job::Job;
pub use report::{CycleOutcome, CycleReport, JobRecord};
pub use scheduler::{JobScheduler, JobSchedulerBuilder, JobSchedulerHandle, SchedulerStats};
pub use types::{JobDescriptor, JobResult, JobStatus};
