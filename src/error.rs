//! Domain errors raised while talking to the CryoCon controller.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the connection, the driver and the poll coordinator.
///
/// The type is `Clone` because a failed sub-request is stored in the
/// last-values cache and handed out again on every read of that attribute
/// until the next poll replaces it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CryoError {
    /// Transport could not be opened, or an I/O call on it failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The instrument did not answer in time.
    #[error("no reply from instrument within {0:?}")]
    Timeout(Duration),

    /// A grouped reply did not carry one field per queued query.
    #[error("expected {expected} replies, instrument sent {got}")]
    ReplyCount { expected: usize, got: usize },

    /// A single reply could not be turned into a value.
    #[error("cannot decode reply {reply:?} to '{command}': {reason}")]
    Decode {
        command: String,
        reply: String,
        reason: String,
    },

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("invalid value {value:?} for attribute '{attribute}'")]
    InvalidValue { attribute: String, value: String },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CryoError {
    /// Returns true for failures that break the whole exchange with the
    /// instrument rather than a single reply.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::ReplyCount { .. }
        )
    }
}

impl From<std::io::Error> for CryoError {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

pub type CryoResult<T> = Result<T, CryoError>;
