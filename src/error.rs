use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse cluster configuration JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid license specification: {0}")]
    InvalidLicenses(String),

    #[error("License {0} is not configured on this cluster")]
    LicenseNotFound(String),

    #[error("Requested license count exceeds the configured total for {0}")]
    LicensesExceedTotal(String),

    #[error("Invalid dependency specification: {0}")]
    InvalidDependency(String),

    #[error("Circular dependency detected for job {0}")]
    CircularDependency(u32),

    #[error("Job {0} was not found")]
    JobNotFound(u32),

    #[error("Partition {0} was not found")]
    PartitionNotFound(String),

    #[error("Job {0} is not in a state that permits this operation")]
    InvalidJobState(u32),

    #[error("Failed to build internal cluster model: {0}")]
    ModelConstructionError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
