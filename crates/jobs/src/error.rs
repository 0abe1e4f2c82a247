use thiserror::Error;

/// Invalid job registration, detected by `JobSchedulerBuilder::build`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("job group '{0}' is registered more than once")]
    DuplicateGroup(String),

    #[error("job '{job}' is registered more than once in group '{group}'")]
    DuplicateJob { group: String, job: String },

    #[error("job '{job}' in group '{group}' depends on unknown job '{dependency}'")]
    UnknownDependency {
        group: String,
        job: String,
        dependency: String,
    },

    #[error("job group '{group}' has a dependency cycle through: {jobs:?}")]
    CyclicDependency { group: String, jobs: Vec<String> },

    #[error("job group '{0}' has a zero interval")]
    InvalidInterval(String),

    #[error("job group '{0}' has no jobs")]
    EmptyGroup(String),
}

/// Scheduler runtime error.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown job group: {0}")]
    UnknownGroup(String),
}
