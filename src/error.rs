use crate::dispatcher::DispatchError;
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a call, a promise or the transport can fail with.
///
/// Errors are `Clone` because one outcome may be handed to many waiters of the
/// same [`Promise`](crate::Promise).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The socket or one of its streams failed. The connection is gone and
    /// every call pending on it has been rejected with this error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame or reply payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The callee raised an application error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The peer could not dispatch the call (unknown binder or method,
    /// undecodable arguments).
    #[error("dispatch failed: {0}")]
    Dispatch(DispatchError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn closed() -> Self {
        Error::Transport("connection is closed".to_owned())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Remote(remote) => Error::Remote(remote),
            other => Error::Dispatch(other),
        }
    }
}

/// An application level failure raised by a binder implementation.
///
/// `kind` keeps the callee's classification (e.g. `"IllegalArgument"`) so the
/// caller can branch on it after the error crossed the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
