use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuizKeepError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Corrupted record under key: {0}")]
    CorruptedRecord(String),

    #[error("Expired record under key: {0}")]
    ExpiredRecord(String),

    #[error("Invalid record shape: {0}")]
    InvalidShape(String),

    #[error("Empty record under key: {0}")]
    EmptyRecord(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event sync error: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for QuizKeepError {
    fn from(err: anyhow::Error) -> Self {
        QuizKeepError::Unknown(err.to_string())
    }
}

impl From<std::io::Error> for QuizKeepError {
    fn from(err: std::io::Error) -> Self {
        QuizKeepError::FileSystem(err.to_string())
    }
}
