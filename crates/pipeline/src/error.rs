use thiserror::Error;

/// Invalid pipeline or pipeline-group configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline '{0}' has a zero queue capacity")]
    InvalidCapacity(String),

    #[error("pipeline group '{0}' is registered more than once")]
    DuplicateGroup(String),

    #[error("pipeline '{pipeline}' is registered more than once in group '{group}'")]
    DuplicatePipeline { group: String, pipeline: String },

    #[error("pipeline group '{0}' has no pipelines")]
    EmptyGroup(String),

    #[error("pipeline group '{0}' has a zero interval")]
    InvalidInterval(String),

    #[error("unknown pipeline group: {0}")]
    UnknownGroup(String),
}
