// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// A boxed error produced by a `Connection` implementation. The original
/// value can be recovered with `downcast_ref`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The broad category of an [`Error`](enum.Error.html). Callers that only
/// need to decide whether to retry later, widen the pool, or report a bug
/// can match on this instead of the individual variants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A `ManagedConnection` was used in a state that does not permit the
    /// operation. Indicates a bug in the calling code.
    LifecycleViolation,
    /// The remote peer understood and rejected the request.
    Application,
    /// Network or availability failures that outlasted the retry budget.
    Transient,
    /// No connection became available within the acquire timeout.
    PoolExhausted,
    /// The pool was configured with unusable settings.
    Configuration,
    /// The pool has been disposed.
    PoolDisposed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::LifecycleViolation => "lifecycle violation".fmt(fmt),
            ErrorKind::Application => "application error".fmt(fmt),
            ErrorKind::Transient => "transient error".fmt(fmt),
            ErrorKind::PoolExhausted => "pool exhausted".fmt(fmt),
            ErrorKind::Configuration => "configuration error".fmt(fmt),
            ErrorKind::PoolDisposed => "pool disposed".fmt(fmt),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot {operation} connection {id} while it is {state}")]
    LifecycleViolation {
        id: u64,
        state: ConnectionState,
        operation: &'static str,
    },
    #[error("request rejected by server: {0}")]
    Application(#[source] BoxError),
    #[error("giving up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error(
        "no server accepted a connection after {attempts} attempt(s); \
         last failure: {source}"
    )]
    AllServersUnavailable {
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("no connection available within {timeout:?}")]
    PoolExhausted { timeout: Duration },
    #[error("no servers configured")]
    NoServers,
    #[error("invalid server address: {0}")]
    InvalidServer(String),
    #[error("connection pool has been disposed")]
    PoolDisposed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LifecycleViolation { .. } => ErrorKind::LifecycleViolation,
            Error::Application(_) => ErrorKind::Application,
            Error::RetriesExhausted { .. } => ErrorKind::Transient,
            Error::AllServersUnavailable { .. } => ErrorKind::Transient,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::NoServers | Error::InvalidServer(_) => {
                ErrorKind::Configuration
            }
            Error::PoolDisposed => ErrorKind::PoolDisposed,
        }
    }

    pub(crate) fn lifecycle(
        id: u64,
        state: ConnectionState,
        operation: &'static str,
    ) -> Self {
        Error::LifecycleViolation {
            id,
            state,
            operation,
        }
    }
}
