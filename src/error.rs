use std::time::Duration;

use thiserror::Error;

/// Structural problems with a session context or its persisted record.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must be a non-empty string")]
    EmptyField(&'static str),
    #[error("unknown contract state `{0}`")]
    UnknownState(String),
    #[error("step log ends at `{logged}` but current state is `{current}`")]
    StepLogMismatch { logged: String, current: String },
    #[error("malformed step log entry `{0}`")]
    MalformedStep(String),
    #[error("unsupported serialization version `{0}`")]
    UnsupportedVersion(String),
    #[error("session id `{given}` does not match context session `{context}`")]
    SessionMismatch { given: String, context: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot serialize session context: {0}")]
    Serialization(ValidationError),
    #[error("cannot deserialize session record: {0}")]
    Deserialization(ValidationError),
    #[error("session record is not valid JSON: {0}")]
    Codec(String),
    #[error("backing store unavailable: {0}")]
    Backend(String),
    #[error("backing store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transition `{from}` -> `{to}` is not allowed")]
    InvalidTransition { from: String, to: String },
}

impl SessionError {
    /// Returns the underlying validation failure, if this error carries one.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Serialization(err) | Self::Deserialization(err) => Some(err),
            _ => None,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

pub(crate) fn serde_error(err: serde_json::Error) -> SessionError {
    SessionError::Codec(err.to_string())
}

#[cfg(feature = "redis")]
pub(crate) fn redis_error(err: redis::RedisError) -> SessionError {
    SessionError::Backend(err.to_string())
}
