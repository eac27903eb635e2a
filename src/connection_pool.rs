// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::backend::Backend;
use crate::connection::{Classify, Connection, FailureKind};
use crate::connection_pool::types::{
    ConnectionCount, ConnectionData, ConnectionPoolOptions,
    ConnectionPoolState, ConnectionPoolStats, ProtectedData,
};
use crate::error::Error;
use crate::invoker::RetryableInvoker;
use crate::listener::{ListenerHub, PoolListener};
use crate::managed_connection::{ManagedConnection, OpenOptions};
use crate::rotation::{ServerRotation, ServerSource};

type Connector<C> = Arc<dyn Fn(&Backend) -> C + Send + Sync>;

/// A pool of connections to a multi-node service
///
/// The pool opens connections against the servers of a
/// [`ServerRotation`](../rotation/struct.ServerRotation.html) in round-robin
/// order, keeps up to `pool_size` of them idle, and lends them out through
/// `acquire` and `release`. Remote operations issued through `invoke` or
/// `execute` are retried on fresh connections when they fail transiently.
///
/// `ConnectionPool` is a cheap handle; clones share the same pool.
pub struct ConnectionPool<C: Connection> {
    protected_data: ProtectedData<C>,
    rotation: Arc<ServerRotation>,
    listeners: Arc<ListenerHub>,
    connector: Connector<C>,
    options: Arc<ConnectionPoolOptions>,
    open_options: Arc<OpenOptions>,
    next_connection_id: Arc<AtomicU64>,
    log: Logger,
}

impl<C: Connection> Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("name", &self.options.name)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .field("rotation", &self.rotation)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> ConnectionPool<C> {
        ConnectionPool {
            protected_data: self.protected_data.clone(),
            rotation: Arc::clone(&self.rotation),
            listeners: Arc::clone(&self.listeners),
            connector: Arc::clone(&self.connector),
            options: Arc::clone(&self.options),
            open_options: Arc::clone(&self.open_options),
            next_connection_id: Arc::clone(&self.next_connection_id),
            log: self.log.clone(),
        }
    }
}

impl<C> ConnectionPool<C>
where
    C: Connection,
{
    /// Create a pool. `create_connection` builds an unopened connection for
    /// a server; the pool opens it. Fails if the server list is empty or
    /// malformed, or if any connection opened while prefilling fails. In that
    /// case the connections already opened are closed again.
    pub fn new<S, F>(
        cpo: ConnectionPoolOptions,
        servers: S,
        create_connection: F,
    ) -> Result<Self, Error>
    where
        S: Into<ServerSource>,
        F: Fn(&Backend) -> C + Send + Sync + 'static,
    {
        Self::with_listeners(cpo, servers, create_connection, Vec::new())
    }

    /// Like `new`, but registers `listeners` before the server list is
    /// loaded and the pool is prefilled so they observe those events too.
    pub fn with_listeners<S, F>(
        cpo: ConnectionPoolOptions,
        servers: S,
        create_connection: F,
        listeners: Vec<Arc<dyn PoolListener>>,
    ) -> Result<Self, Error>
    where
        S: Into<ServerSource>,
        F: Fn(&Backend) -> C + Send + Sync + 'static,
    {
        let logger = cpo
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => cpo.name.clone()));

        let hub = Arc::new(ListenerHub::new(cpo.name.clone()));
        listeners.into_iter().for_each(|l| hub.add(l));

        let rotation = Arc::new(ServerRotation::new(
            servers.into(),
            Arc::clone(&hub),
            logger.clone(),
        )?);

        let open_options = OpenOptions {
            timeout: cpo.connect_timeout,
            credentials: cpo.credentials.clone(),
            namespace: cpo.namespace.clone(),
        };

        let connection_data = ConnectionData::new(cpo.pool_size as usize);
        let prefill = cpo.prefill;

        let pool = ConnectionPool {
            protected_data: ProtectedData::new(connection_data),
            rotation,
            listeners: hub,
            connector: Arc::new(create_connection),
            options: Arc::new(cpo),
            open_options: Arc::new(open_options),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            log: logger,
        };

        info!(pool.log, "connection pool created";
            "pool_size" => pool.options.pool_size,
            "max_overflow" => %pool.options.max_overflow,
            "servers" => pool.rotation.len());

        if prefill {
            if let Err(err) = pool.fill() {
                warn!(pool.log, "prefill failed"; "error" => %err);
                pool.dispose();
                return Err(err);
            }
        }
        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// In sticky mode a thread that already holds a connection gets that same
    /// connection back. Otherwise a new connection is opened while fewer than
    /// `pool_size` are live, or while the idle queue is empty and overflow
    /// capacity remains; failing that an idle connection is taken, waiting up
    /// to `pool_timeout` for one to be released.
    pub fn acquire(&self) -> Result<ManagedConnection<C>, Error> {
        if self.options.sticky {
            let mut connection_data = self.protected_data.connection_data_lock();
            if connection_data.state == ConnectionPoolState::Disposed {
                return Err(Error::PoolDisposed);
            }
            let thread_id = thread::current().id();
            if let Some(conn) = connection_data.pinned.get(&thread_id) {
                if !conn.is_disposed() {
                    trace!(self.log, "returning pinned connection";
                        "thread" => ?thread_id);
                    return Ok(conn.clone());
                }
                connection_data.pinned.remove(&thread_id);
            }
        }

        let conn = self.checkout_connection()?;
        self.pin(&conn);
        Ok(conn)
    }

    /// Return a connection to the pool.
    ///
    /// In sticky mode the calling thread's pinned connection is released
    /// instead of `conn`, and nothing happens if the thread has none.
    /// Releasing a connection that has been disposed is a no-op. A connection
    /// that has served more than `recycle` operations is replaced with a new
    /// one. If the idle queue is full, or the pool has been disposed, the
    /// connection is closed instead of being queued.
    pub fn release(&self, conn: ManagedConnection<C>) -> Result<(), Error> {
        let conn = if self.options.sticky {
            let mut connection_data = self.protected_data.connection_data_lock();
            match connection_data.pinned.remove(&thread::current().id()) {
                Some(pinned) => pinned,
                None => {
                    trace!(self.log, "release: no connection pinned to thread");
                    return Ok(());
                }
            }
        } else {
            conn
        };

        if conn.is_disposed() {
            trace!(self.log, "release: connection already disposed";
                "connection" => conn.id());
            return Ok(());
        }

        conn.reset_retry_count();
        conn.checkin()?;
        self.listeners.checked_in(conn.id(), &conn.server());

        let conn = if self.state() == ConnectionPoolState::Active
            && self.options.recycle.exceeded_by(conn.operation_count())
        {
            match self.recycle(conn) {
                Some(replacement) => replacement,
                None => return Ok(()),
            }
        } else {
            conn
        };

        let reason = {
            let mut connection_data = self.protected_data.connection_data_lock();
            if connection_data.state == ConnectionPoolState::Disposed {
                "pool disposed"
            } else if connection_data.idle.len()
                < self.options.pool_size as usize
            {
                debug!(self.log, "connection returned to pool";
                    "connection" => conn.id());
                connection_data.idle.push_back(conn);
                self.protected_data.condvar_notify();
                return Ok(());
            } else {
                "pool is already full"
            }
        };

        // Overflow shrink-back
        self.close_and_free_slot(&conn, reason);
        Ok(())
    }

    /// Close every idle connection and stop handing out connections.
    /// Connections that are checked out are not reclaimed; they are closed
    /// when they are released.
    pub fn dispose(&self) {
        let idle: Vec<ManagedConnection<C>> = {
            let mut connection_data = self.protected_data.connection_data_lock();
            if connection_data.state == ConnectionPoolState::Disposed {
                trace!(self.log, "dispose: pool already disposed");
                return;
            }
            connection_data.state = ConnectionPoolState::Disposed;
            let idle: Vec<_> = connection_data.idle.drain(..).collect();
            connection_data.live_count -=
                ConnectionCount::from(idle.len() as u32);
            self.protected_data.condvar_notify_all();
            idle
        };

        info!(self.log, "disposing connection pool";
            "idle_connections" => idle.len());
        for conn in idle {
            if let Err(err) = conn.dispose("pool disposed") {
                warn!(self.log, "failed to dispose idle connection";
                    "error" => %err);
            }
        }
        self.listeners.pool_disposed();
    }

    /// Replace the server rotation. `servers` may be a literal list or a
    /// provider function.
    pub fn set_server_list<S: Into<ServerSource>>(
        &self,
        servers: S,
    ) -> Result<(), Error> {
        self.rotation.refresh(servers.into())
    }

    /// Open connections until `pool_size` are live.
    pub fn fill(&self) -> Result<(), Error> {
        loop {
            {
                let mut connection_data =
                    self.protected_data.connection_data_lock();
                if connection_data.state == ConnectionPoolState::Disposed {
                    return Err(Error::PoolDisposed);
                }
                if connection_data.live_count
                    >= ConnectionCount::from(self.options.pool_size)
                {
                    return Ok(());
                }
                connection_data.live_count += 1.into();
            }

            let conn = self.open_in_reserved_slot()?;
            let mut connection_data = self.protected_data.connection_data_lock();
            if connection_data.state == ConnectionPoolState::Disposed {
                drop(connection_data);
                self.close_and_free_slot(&conn, "pool disposed");
                return Err(Error::PoolDisposed);
            }
            connection_data.idle.push_back(conn);
            self.protected_data.condvar_notify();
        }
    }

    /// Invoke `operation` on `conn`, retrying transient failures on fresh
    /// connections. See [`RetryableInvoker`](../invoker/struct.RetryableInvoker.html).
    pub fn invoke(
        &self,
        conn: &ManagedConnection<C>,
        operation: &str,
        args: &C::Args,
    ) -> Result<C::Reply, Error> {
        RetryableInvoker::new(self).invoke(conn, operation, args, true)
    }

    /// Invoke `operation` on `conn` without retrying. For operations that
    /// are not safe to repeat.
    pub fn invoke_once(
        &self,
        conn: &ManagedConnection<C>,
        operation: &str,
        args: &C::Args,
    ) -> Result<C::Reply, Error> {
        RetryableInvoker::new(self).invoke(conn, operation, args, false)
    }

    /// Acquire a connection, invoke `operation` with retries, and release the
    /// connection again.
    pub fn execute(
        &self,
        operation: &str,
        args: &C::Args,
    ) -> Result<C::Reply, Error> {
        let conn = self.acquire()?;
        let result = self.invoke(&conn, operation, args);
        let released = self.release(conn);
        let reply = result?;
        released?;
        Ok(reply)
    }

    pub fn add_listener(&self, listener: Arc<dyn PoolListener>) {
        self.listeners.add(listener);
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let connection_data = self.protected_data.connection_data_lock();
        let live: u32 = connection_data.live_count.into();
        let idle = connection_data.idle.len() as u32;
        ConnectionPoolStats {
            live_connections: live.into(),
            idle_connections: idle.into(),
            checked_out_connections: live.saturating_sub(idle).into(),
            overflow_connections: live
                .saturating_sub(self.options.pool_size)
                .into(),
            pinned_threads: (connection_data.pinned.len() as u32).into(),
        }
    }

    /// The configured number of idle connections.
    pub fn size(&self) -> u32 {
        self.options.pool_size
    }

    /// Live connections beyond `pool_size`.
    pub fn overflow(&self) -> u32 {
        self.stats().overflow_connections.into()
    }

    /// Connections waiting in the idle queue.
    pub fn checked_in(&self) -> u32 {
        self.stats().idle_connections.into()
    }

    /// Connections currently held by callers.
    pub fn checked_out(&self) -> u32 {
        self.stats().checked_out_connections.into()
    }

    pub fn state(&self) -> ConnectionPoolState {
        self.protected_data.connection_data_lock().state
    }

    pub fn options(&self) -> &ConnectionPoolOptions {
        &self.options
    }

    pub fn rotation(&self) -> &ServerRotation {
        &self.rotation
    }

    pub(crate) fn listeners(&self) -> &ListenerHub {
        &self.listeners
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Check out a connection ignoring any sticky pin. Used by `acquire` and
    /// by the retry loop when it needs a replacement connection.
    pub(crate) fn checkout_connection(
        &self,
    ) -> Result<ManagedConnection<C>, Error> {
        let pool_size = ConnectionCount::from(self.options.pool_size);
        let max_live = self
            .options
            .max_overflow
            .added_to(self.options.pool_size)
            .map(ConnectionCount::from);
        // A deadline too far out to represent waits forever.
        let deadline = self
            .options
            .pool_timeout
            .and_then(|t| Instant::now().checked_add(t));

        let mut connection_data = self.protected_data.connection_data_lock();
        let mut timed_out = false;
        loop {
            if connection_data.state == ConnectionPoolState::Disposed {
                return Err(Error::PoolDisposed);
            }

            let live = connection_data.live_count;
            let may_open = live < pool_size
                || (connection_data.idle.is_empty()
                    && max_live.map_or(true, |max| live < max));

            if may_open {
                connection_data.live_count += 1.into();
                drop(connection_data);
                trace!(self.log, "acquire: opening new connection";
                    "live" => %live);
                let conn = self.open_in_reserved_slot()?;
                return self.hand_out(conn);
            }

            if let Some(conn) = connection_data.idle.pop_front() {
                drop(connection_data);
                return self.hand_out(conn);
            }

            if timed_out {
                break;
            }

            trace!(self.log, "acquire: waiting for a connection");
            let (guard, t) =
                self.protected_data.condvar_wait(connection_data, deadline);
            connection_data = guard;
            timed_out = t;
        }

        let live: u32 = connection_data.live_count.into();
        drop(connection_data);

        let timeout = self.options.pool_timeout.unwrap_or(Duration::ZERO);
        warn!(self.log, "no connection available";
            "live" => live, "timeout" => ?timeout);
        self.listeners.pool_at_max(
            self.options.pool_size,
            self.options.max_overflow,
            live,
        );
        Err(Error::PoolExhausted { timeout })
    }

    /// Dispose `conn` after a failure, unpinning it from the calling thread,
    /// and give up its slot.
    pub(crate) fn discard(&self, conn: &ManagedConnection<C>, reason: &str) {
        if self.options.sticky {
            let mut connection_data = self.protected_data.connection_data_lock();
            let thread_id = thread::current().id();
            if connection_data
                .pinned
                .get(&thread_id)
                .map_or(false, |pinned| pinned.same_as(conn))
            {
                connection_data.pinned.remove(&thread_id);
            }
        }
        self.close_and_free_slot(conn, reason);
    }

    /// Pin `conn` to the calling thread when running in sticky mode.
    pub(crate) fn pin(&self, conn: &ManagedConnection<C>) {
        if self.options.sticky {
            let mut connection_data = self.protected_data.connection_data_lock();
            connection_data
                .pinned
                .insert(thread::current().id(), conn.clone());
        }
    }

    fn hand_out(
        &self,
        conn: ManagedConnection<C>,
    ) -> Result<ManagedConnection<C>, Error> {
        conn.checkout()?;
        self.listeners.checked_out(conn.id(), &conn.server());
        Ok(conn)
    }

    // The caller has already counted the new connection in live_count. The
    // slot is given back if no connection can be opened.
    fn open_in_reserved_slot(&self) -> Result<ManagedConnection<C>, Error> {
        self.create_connection().map_err(|err| {
            self.free_slot();
            err
        })
    }

    // Try servers in rotation order, visiting each server at most twice.
    fn create_connection(&self) -> Result<ManagedConnection<C>, Error> {
        let max_attempts = (2 * self.rotation.len()).max(1) as u32;
        let mut attempts = 0;
        loop {
            let server = self.rotation.next();
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let raw = (self.connector)(&server);
            attempts += 1;

            let err = match ManagedConnection::open(
                id,
                server.clone(),
                raw,
                &self.open_options,
                Arc::clone(&self.listeners),
                self.log.clone(),
            ) {
                Ok(conn) => return Ok(conn),
                Err(err) => err,
            };

            warn!(self.log, "failed to open connection";
                "server" => %server, "attempt" => attempts, "error" => %err);
            self.listeners.failed(&server, None, &err, None);

            if err.kind() == FailureKind::Application {
                return Err(Error::Application(Box::new(err)));
            }
            if attempts >= max_attempts {
                return Err(Error::AllServersUnavailable {
                    attempts,
                    source: Box::new(err),
                });
            }
        }
    }

    // Swap an over-used connection for a new one. On failure the old
    // connection is still closed and its slot freed.
    fn recycle(
        &self,
        old: ManagedConnection<C>,
    ) -> Option<ManagedConnection<C>> {
        let old_server = old.server();
        match self.create_connection() {
            Ok(new) => {
                self.listeners.recycled(
                    (old.id(), &old_server),
                    (new.id(), &new.server()),
                    old.operation_count(),
                );
                if let Err(err) = old.dispose("recycling connection") {
                    warn!(self.log, "failed to dispose recycled connection";
                        "error" => %err);
                }
                Some(new)
            }
            Err(err) => {
                warn!(self.log, "could not open replacement connection";
                    "server" => %old_server, "error" => %err);
                self.close_and_free_slot(&old, "recycling connection");
                None
            }
        }
    }

    fn close_and_free_slot(&self, conn: &ManagedConnection<C>, reason: &str) {
        match conn.dispose(reason) {
            Ok(()) => self.free_slot(),
            Err(err) => warn!(self.log, "connection already disposed";
                "error" => %err),
        }
    }

    fn free_slot(&self) {
        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.live_count -= 1.into();
        self.protected_data.condvar_notify();
    }
}
