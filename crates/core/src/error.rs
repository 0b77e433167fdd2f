use thiserror::Error;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No audience name mapped for group {0}")]
    UnmappedGroup(u32),

    #[error("Input is not sorted by descending score at row {row}")]
    UnsortedInput { row: usize },

    #[error("Partition invariant violated for group {group_number}: {reason}")]
    PartitionInvariant { group_number: u32, reason: String },

    #[error("Visitor {0} appears more than once in the dataset")]
    DuplicateVisitor(String),

    #[error("Cohort arm is empty: {0}")]
    EmptyCohort(String),

    #[error("Statistics error: {0}")]
    Stats(String),

    #[error("Config loading error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
