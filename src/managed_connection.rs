// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use slog::{debug, error, trace, Logger};

use crate::backend::Backend;
use crate::connection::{Connection, ConnectionState, Credentials};
use crate::error::Error;
use crate::listener::ListenerHub;

/// The most recent operation issued on a connection, kept for failure
/// reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestSnapshot {
    pub operation: String,
    /// `Debug` rendering of the operation arguments.
    pub args: String,
}

impl fmt::Display for RequestSnapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}({})", self.operation, self.args)
    }
}

/// The failure of a single `ManagedConnection::invoke` call.
#[derive(Debug)]
pub enum InvokeError<E> {
    /// The connection was not checked out.
    Lifecycle(Error),
    /// The underlying connection returned an error, passed through as is.
    Remote(E),
}

impl<E: fmt::Display> fmt::Display for InvokeError<E> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InvokeError::Lifecycle(err) => err.fmt(fmt),
            InvokeError::Remote(err) => err.fmt(fmt),
        }
    }
}

impl<E: StdError + 'static> StdError for InvokeError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            InvokeError::Lifecycle(err) => Some(err),
            InvokeError::Remote(err) => Some(err),
        }
    }
}

// Settings applied to every connection as it is opened.
#[derive(Clone, Debug, Default)]
pub(crate) struct OpenOptions {
    pub timeout: Option<Duration>,
    pub credentials: Option<Credentials>,
    pub namespace: Option<String>,
}

struct Wrapper<C> {
    // None once the connection has been disposed.
    connection: Option<C>,
    id: u64,
    server: Backend,
    state: ConnectionState,
    retry_count: u32,
    operation_count: u64,
    created_at: DateTime<Utc>,
    last_request: Option<RequestSnapshot>,
}

// Authenticate and bind the namespace, when configured.
fn prepare<C: Connection>(
    connection: &mut C,
    opts: &OpenOptions,
) -> Result<(), C::Error> {
    if let Some(credentials) = &opts.credentials {
        connection.authenticate(credentials)?;
    }
    if let Some(namespace) = &opts.namespace {
        connection.select_namespace(namespace)?;
    }
    Ok(())
}

/// A pool-owned wrapper around one open RPC session.
///
/// `ManagedConnection` is a shared handle: clones refer to the same wrapper.
/// The pool hands one out from `acquire` and expects it back through
/// `release`. Between the two it must only be used by one thread at a time.
pub struct ManagedConnection<C: Connection> {
    inner: Arc<Mutex<Wrapper<C>>>,
    hub: Arc<ListenerHub>,
    log: Logger,
}

impl<C: Connection> Clone for ManagedConnection<C> {
    fn clone(&self) -> Self {
        ManagedConnection {
            inner: Arc::clone(&self.inner),
            hub: Arc::clone(&self.hub),
            log: self.log.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for ManagedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let w = self.lock();
        f.debug_struct("ManagedConnection")
            .field("id", &w.id)
            .field("server", &w.server.name)
            .field("state", &w.state)
            .field("retry_count", &w.retry_count)
            .field("operation_count", &w.operation_count)
            .field("created_at", &w.created_at)
            .finish()
    }
}

impl<C: Connection> ManagedConnection<C> {
    /// Open `connection` against `server`: connect, then authenticate and
    /// select the namespace when configured. A half-opened connection is
    /// closed before the error is returned.
    pub(crate) fn open(
        id: u64,
        server: Backend,
        mut connection: C,
        opts: &OpenOptions,
        hub: Arc<ListenerHub>,
        log: Logger,
    ) -> Result<Self, C::Error> {
        trace!(log, "opening connection"; "connection" => id, "server" => %server);
        connection.connect(opts.timeout)?;

        if let Err(err) = prepare(&mut connection, opts) {
            if let Err(close_err) = connection.close() {
                debug!(log, "failed to close half-opened connection";
                    "server" => %server, "error" => %close_err);
            }
            return Err(err);
        }

        let managed = ManagedConnection {
            inner: Arc::new(Mutex::new(Wrapper {
                connection: Some(connection),
                id,
                server,
                state: ConnectionState::InQueue,
                retry_count: 0,
                operation_count: 0,
                created_at: Utc::now(),
                last_request: None,
            })),
            hub,
            log,
        };
        {
            let w = managed.lock();
            debug!(managed.log, "connection opened";
                "connection" => w.id, "server" => %w.server);
            managed.hub.created(w.id, &w.server);
        }
        Ok(managed)
    }

    fn lock(&self) -> MutexGuard<Wrapper<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the connection to a caller. Only an `InQueue` connection may be
    /// checked out.
    pub fn checkout(&self) -> Result<(), Error> {
        let mut w = self.lock();
        match w.state {
            ConnectionState::InQueue => {
                w.state = ConnectionState::CheckedOut;
                Ok(())
            }
            state => Err(Error::lifecycle(w.id, state, "check out")),
        }
    }

    /// Return the connection to the idle state. Checking in a connection that
    /// is already in the queue or has been disposed is an error.
    pub fn checkin(&self) -> Result<(), Error> {
        let mut w = self.lock();
        match w.state {
            ConnectionState::CheckedOut => {
                w.state = ConnectionState::InQueue;
                Ok(())
            }
            state => Err(Error::lifecycle(w.id, state, "check in")),
        }
    }

    /// Close the underlying connection and mark the wrapper disposed. A close
    /// failure is reported to the listeners but the wrapper is disposed
    /// regardless. Disposing twice is an error.
    pub fn dispose(&self, reason: &str) -> Result<(), Error> {
        let (id, server, close_result) = {
            let mut w = self.lock();
            if w.state == ConnectionState::Disposed {
                return Err(Error::lifecycle(
                    w.id,
                    ConnectionState::Disposed,
                    "dispose",
                ));
            }
            w.state = ConnectionState::Disposed;
            let close_result = match w.connection.take() {
                Some(mut conn) => conn.close(),
                None => Ok(()),
            };
            (w.id, w.server.clone(), close_result)
        };

        match &close_result {
            Ok(()) => {
                debug!(self.log, "connection disposed";
                    "connection" => id, "server" => %server, "reason" => reason);
                self.hub.disposed(id, &server, reason, None);
            }
            Err(err) => {
                error!(self.log, "error closing connection";
                    "connection" => id, "server" => %server,
                    "reason" => reason, "error" => %err);
                self.hub.disposed(id, &server, reason, Some(err));
            }
        }
        Ok(())
    }

    /// Perform one remote operation. The connection's error is returned
    /// unchanged; retrying is the job of the `RetryableInvoker`.
    pub fn invoke(
        &self,
        operation: &str,
        args: &C::Args,
    ) -> Result<C::Reply, InvokeError<C::Error>> {
        let mut w = self.lock();
        let id = w.id;
        if w.state != ConnectionState::CheckedOut {
            return Err(InvokeError::Lifecycle(Error::lifecycle(
                id, w.state, "invoke",
            )));
        }
        w.operation_count += 1;
        w.last_request = Some(RequestSnapshot {
            operation: operation.to_string(),
            args: format!("{:?}", args),
        });
        match w.connection.as_mut() {
            Some(conn) => conn.invoke(operation, args).map_err(InvokeError::Remote),
            None => Err(InvokeError::Lifecycle(Error::lifecycle(
                id,
                ConnectionState::Disposed,
                "invoke",
            ))),
        }
    }

    /// Take over the session, server, identity, state and operation count of
    /// `other`, which is dropped. The consecutive-retry count stays with this
    /// wrapper so a retry loop spanning several replacements stays bounded.
    pub fn replace_with(&self, other: ManagedConnection<C>) {
        if self.same_as(&other) {
            return;
        }
        let mut mine = self.lock();
        let mut theirs = other.lock();
        mem::swap(&mut mine.connection, &mut theirs.connection);
        mem::swap(&mut mine.id, &mut theirs.id);
        mem::swap(&mut mine.server, &mut theirs.server);
        mem::swap(&mut mine.state, &mut theirs.state);
        mem::swap(&mut mine.operation_count, &mut theirs.operation_count);
        mem::swap(&mut mine.created_at, &mut theirs.created_at);
        trace!(self.log, "connection replaced";
            "old_connection" => theirs.id, "connection" => mine.id,
            "server" => %mine.server);
    }

    /// Whether both handles refer to the same wrapper.
    pub fn same_as(&self, other: &ManagedConnection<C>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> u64 {
        self.lock().id
    }

    pub fn server(&self) -> Backend {
        self.lock().server.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ConnectionState::Disposed
    }

    /// Consecutive failed attempts of the current logical operation.
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Operations issued over the lifetime of the session.
    pub fn operation_count(&self) -> u64 {
        self.lock().operation_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }

    pub fn last_request(&self) -> Option<RequestSnapshot> {
        self.lock().last_request.clone()
    }

    pub(crate) fn increment_retry_count(&self) -> u32 {
        let mut w = self.lock();
        w.retry_count += 1;
        w.retry_count
    }

    pub(crate) fn reset_retry_count(&self) {
        self.lock().retry_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Classify, FailureKind};
    use slog::{o, Discard};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct EchoConnection {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
        fail_namespace: bool,
    }

    #[derive(Debug)]
    struct EchoError(FailureKind);

    impl fmt::Display for EchoError {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "echo error ({:?})", self.0)
        }
    }

    impl StdError for EchoError {}

    impl Classify for EchoError {
        fn kind(&self) -> FailureKind {
            self.0
        }
    }

    impl Connection for EchoConnection {
        type Args = Vec<u8>;
        type Reply = usize;
        type Error = EchoError;

        fn connect(&mut self, _timeout: Option<Duration>) -> Result<(), EchoError> {
            Ok(())
        }

        fn select_namespace(&mut self, _name: &str) -> Result<(), EchoError> {
            if self.fail_namespace {
                Err(EchoError(FailureKind::Application))
            } else {
                Ok(())
            }
        }

        fn invoke(&mut self, _op: &str, args: &Vec<u8>) -> Result<usize, EchoError> {
            Ok(args.len())
        }

        fn close(&mut self) -> Result<(), EchoError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(EchoError(FailureKind::Transient))
            } else {
                Ok(())
            }
        }
    }

    fn open(id: u64, conn: EchoConnection) -> ManagedConnection<EchoConnection> {
        let log = Logger::root(Discard, o!());
        let hub = Arc::new(ListenerHub::new("test"));
        ManagedConnection::open(
            id,
            Backend::new("localhost", 9160),
            conn,
            &OpenOptions::default(),
            hub,
            log,
        )
        .unwrap()
    }

    fn echo(closes: &Arc<AtomicUsize>) -> EchoConnection {
        EchoConnection {
            closes: closes.clone(),
            fail_close: false,
            fail_namespace: false,
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = open(1, echo(&closes));
        assert_eq!(conn.state(), ConnectionState::InQueue);

        // A fresh connection has not been handed out yet.
        assert!(conn.checkin().is_err());

        conn.checkout().unwrap();
        assert!(conn.checkout().is_err());
        conn.checkin().unwrap();
        let err = conn.checkin().unwrap_err();
        assert!(matches!(
            err,
            Error::LifecycleViolation {
                state: ConnectionState::InQueue,
                ..
            }
        ));

        conn.checkout().unwrap();
        conn.dispose("test").unwrap();
        assert!(conn.is_disposed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert!(conn.dispose("again").is_err());
        assert!(conn.checkin().is_err());
        assert!(conn.checkout().is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_requires_checkout() {
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = open(1, echo(&closes));
        assert!(matches!(
            conn.invoke("get", &vec![1]),
            Err(InvokeError::Lifecycle(_))
        ));
        assert_eq!(conn.operation_count(), 0);

        conn.checkout().unwrap();
        assert_eq!(conn.invoke("get", &vec![1, 2, 3]).unwrap(), 3);
        assert_eq!(conn.operation_count(), 1);
        let snapshot = conn.last_request().unwrap();
        assert_eq!(snapshot.operation, "get");
        assert_eq!(snapshot.args, "[1, 2, 3]");
        assert_eq!(snapshot.to_string(), "get([1, 2, 3])");
    }

    #[test]
    fn dispose_survives_close_failure() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut c = echo(&closes);
        c.fail_close = true;
        let conn = open(1, c);
        conn.dispose("broken").unwrap();
        assert!(conn.is_disposed());
    }

    #[test]
    fn failed_setup_closes_connection() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut c = echo(&closes);
        c.fail_namespace = true;
        let opts = OpenOptions {
            namespace: Some(String::from("ks")),
            ..OpenOptions::default()
        };
        let result = ManagedConnection::open(
            1,
            Backend::new("localhost", 9160),
            c,
            &opts,
            Arc::new(ListenerHub::new("test")),
            Logger::root(Discard, o!()),
        );
        assert!(matches!(result, Err(EchoError(FailureKind::Application))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_with_keeps_retry_count() {
        let closes = Arc::new(AtomicUsize::new(0));
        let holder = open(1, echo(&closes));
        holder.checkout().unwrap();
        holder.invoke("get", &vec![]).unwrap();
        holder.increment_retry_count();
        holder.dispose("failed").unwrap();

        let fresh = open(2, echo(&closes));
        fresh.checkout().unwrap();
        let alias = holder.clone();
        holder.replace_with(fresh);

        assert_eq!(alias.id(), 2);
        assert_eq!(alias.state(), ConnectionState::CheckedOut);
        assert_eq!(alias.operation_count(), 0);
        assert_eq!(alias.retry_count(), 1);
        assert_eq!(alias.invoke("get", &vec![9]).unwrap(), 1);
        assert!(alias.same_as(&holder));
    }
}
