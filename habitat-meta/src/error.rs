use thiserror::Error;

#[derive(Error, Debug)]
pub enum HdbError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Log IO error: {0}")]
    LogIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for HdbError {
    fn from(error: rusqlite::Error) -> Self {
        HdbError::LogIo(error.to_string())
    }
}

impl From<serde_json::Error> for HdbError {
    fn from(error: serde_json::Error) -> Self {
        HdbError::Serialization(error.to_string())
    }
}

impl From<base64::DecodeError> for HdbError {
    fn from(error: base64::DecodeError) -> Self {
        HdbError::Serialization(format!("invalid base64 payload: {}", error))
    }
}

pub type Result<T> = std::result::Result<T, HdbError>;
