//! Error types at the service's internal seams.
//!
//! Every per-call error ends up as a [`CallFailure`] at the dispatcher
//! boundary; none of these escape to the bus as a fault.

use thiserror::Error;
use ubusproto::CallFailure;

/// Why an object was left off the bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("object {0} declares no methods")]
    NoMethods(String),

    #[error("object {0} is already registered")]
    DuplicateObject(String),

    #[error("object {object} declares method {method} twice")]
    DuplicateMethod { object: String, method: String },
}

/// Script backend failures, one per fixed reply reason.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot load script {path}: {message}")]
    NotFound { path: String, message: String },

    #[error("script {path} has no callable {name}")]
    Unsupported { path: String, name: String },

    #[error("script call {name} failed: {message}")]
    CallFailed { name: String, message: String },

    #[error("script call {name} returned no text")]
    NoResponse { name: String },
}

impl ScriptError {
    pub fn failure(&self) -> CallFailure {
        match self {
            ScriptError::NotFound { .. } => CallFailure::CallbackNotFound,
            ScriptError::Unsupported { .. } => CallFailure::MethodUnsupported,
            ScriptError::CallFailed { .. } => CallFailure::CallFailed,
            ScriptError::NoResponse { .. } => CallFailure::NoResponse,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox closed")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
}

impl MailboxError {
    /// Both outcomes leave the caller without data.
    pub fn failure(&self) -> CallFailure {
        CallFailure::NoData
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker address {0}")]
    Address(String),

    #[error("broker I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker protocol: {0}")]
    Protocol(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("broker link closed")]
    Closed,
}
