use crate::layout::EntityRef;
use std::time::Duration;
use thiserror::Error;

/// How the pipeline reacts to a failure. Only `FatalTransport` stops ingestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Configuration,
    RecoverableStorage,
    NonFatalLog,
    FatalTransport,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Configuration => "configuration",
            ErrorClass::RecoverableStorage => "recoverable_storage",
            ErrorClass::NonFatalLog => "non_fatal_log",
            ErrorClass::FatalTransport => "fatal_transport",
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::FatalTransport)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no route configured for topic")]
    UnknownTopic { topic: String },
    #[error("payload is not valid UTF-8")]
    NotUtf8 { topic: String },
    #[error("payload {payload:?} is not a decimal number")]
    NotNumeric { topic: String, payload: String },
}

impl ValidationError {
    pub fn topic(&self) -> &str {
        match self {
            ValidationError::UnknownTopic { topic }
            | ValidationError::NotUtf8 { topic }
            | ValidationError::NotNumeric { topic, .. } => topic,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Storage collaborators surface every failure as this one condition.
#[derive(Debug, Clone, Error)]
#[error("storage unavailable or rejected: {reason}")]
pub struct StoreError {
    reason: String,
}

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("{entity} does not exist in storage")]
    MissingEntity { entity: EntityRef },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

impl CommitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CommitError::MissingEntity { .. } => ErrorClass::Configuration,
            CommitError::Storage(_) | CommitError::Timeout(_) => ErrorClass::RecoverableStorage,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupLogError {
    #[error("backup log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup log CSV write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("backup log writer task failed: {0}")]
    Worker(String),
    #[error("backup log append timed out after {0:?}")]
    Timeout(Duration),
}

impl BackupLogError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::NonFatalLog
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("cannot connect to MQTT broker {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("MQTT connection lost: {0}")]
    Disconnected(String),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::FatalTransport
    }
}

/// What handling one transport event can fail with. The class decides whether the loop goes on.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Validation(err) => err.class(),
            IngestError::Transport(err) => err.class(),
        }
    }
}
