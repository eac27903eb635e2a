// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::time::Duration;

/// Key/value login material handed to `Connection::authenticate`.
pub type Credentials = HashMap<String, String>;

/// Whether a failure reported by a `Connection` is worth retrying elsewhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The server understood the request and rejected it. Retrying against a
    /// different server will not help.
    Application,
    /// A timeout, an unavailable replica, or a transport fault. The request
    /// may succeed on a different connection.
    Transient,
}

/// Classification of the errors returned by a `Connection`.
///
/// The retry loop consults this exactly once per failure; nothing else in the
/// pool looks at error types.
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

/// Raw transport failures are always retryable.
impl Classify for io::Error {
    fn kind(&self) -> FailureKind {
        FailureKind::Transient
    }
}

/// The lifecycle state of a pooled connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Idle in the pool, or freshly opened and not yet handed out.
    InQueue,
    /// Held by a caller.
    CheckedOut,
    /// Closed. Terminal.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::InQueue => String::from("in queue").fmt(fmt),
            ConnectionState::CheckedOut => {
                String::from("checked out").fmt(fmt)
            }
            ConnectionState::Disposed => String::from("disposed").fmt(fmt),
        }
    }
}

/// Pool connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a connection pool. A connection is one stateful
/// RPC session that serves a single call at a time. It need not be limited to
/// a TCP socket, but could be any logical notion of a session to a server.
///
/// Connections are built by a connector function supplied to
/// `ConnectionPool::new` (`Fn(&Backend) -> C`) and then opened by the pool
/// in this order: `connect`, `authenticate` (only when credentials are
/// configured), `select_namespace` (only when a namespace is configured).
/// After that the pool calls `invoke` any number of times and finally
/// `close`.
pub trait Connection: Send + Sized + 'static {
    /// The arguments of a remote operation. Only its `Debug` rendering is
    /// retained by the pool, for failure reports.
    type Args: fmt::Debug;
    /// The result of a remote operation.
    type Reply;
    /// The error type returned by any of the connection operations. Each
    /// error must say whether it is an application-level rejection or a
    /// transient failure.
    type Error: error::Error + Classify + Send + Sync + 'static;

    /// Attempt to establish the session. `timeout` bounds the connect and,
    /// where the transport supports it, each later socket operation.
    fn connect(&mut self, timeout: Option<Duration>) -> Result<(), Self::Error>;

    /// Log in with the configured credentials.
    fn authenticate(
        &mut self,
        _credentials: &Credentials,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Bind the session to a namespace (keyspace, database, ...).
    fn select_namespace(&mut self, _name: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Perform the named remote operation.
    fn invoke(
        &mut self,
        operation: &str,
        args: &Self::Args,
    ) -> Result<Self::Reply, Self::Error>;

    /// Close the session.
    fn close(&mut self) -> Result<(), Self::Error>;
}
