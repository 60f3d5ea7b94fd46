use habitat_meta::HdbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HabitatError {
    #[error(transparent)]
    Hdb(#[from] HdbError),

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

    #[error("External driver error: {0}")]
    ExternalDriver(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Surface classification used when errors cross a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    Conflict,
    Timeout,
    LogIo,
    Serialization,
    ExternalDriver,
    SchemaViolation,
    Internal,
}

impl HabitatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HabitatError::Hdb(error) => match error {
                HdbError::InvalidInput(_)
                | HdbError::InvalidPatch(_)
                | HdbError::UnknownSchema(_) => ErrorKind::InvalidInput,
                HdbError::NotFound(_) => ErrorKind::NotFound,
                HdbError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                HdbError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
                HdbError::Conflict(_) => ErrorKind::Conflict,
                HdbError::Timeout(_) => ErrorKind::Timeout,
                HdbError::LogIo(_) | HdbError::CorruptMetadata(_) | HdbError::Io(_) => {
                    ErrorKind::LogIo
                }
                HdbError::Serialization(_) => ErrorKind::Serialization,
                HdbError::SchemaViolation(_) => ErrorKind::SchemaViolation,
                HdbError::Internal(_) => ErrorKind::Internal,
            },
            HabitatError::InvalidInput(_) => ErrorKind::InvalidInput,
            HabitatError::NotFound(_) => ErrorKind::NotFound,
            HabitatError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            HabitatError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            HabitatError::Conflict(_) => ErrorKind::Conflict,
            HabitatError::Timeout(_) => ErrorKind::Timeout,
            HabitatError::ExternalDriver(_) | HabitatError::Http(_) => ErrorKind::ExternalDriver,
            HabitatError::Config(_) | HabitatError::Io(_) | HabitatError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<serde_json::Error> for HabitatError {
    fn from(error: serde_json::Error) -> Self {
        HabitatError::Hdb(HdbError::from(error))
    }
}

impl From<reqwest::Error> for HabitatError {
    fn from(error: reqwest::Error) -> Self {
        HabitatError::Http(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HabitatError>;
