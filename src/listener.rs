// Copyright 2020 Joyent, Inc.

//! Observer hooks for pool and connection lifecycle events.
//!
//! Implement [`PoolListener`](trait.PoolListener.html), overriding only the
//! hooks of interest, and register it with `ConnectionPool::add_listener`.
//! Listeners are called synchronously on the thread that caused the event,
//! sometimes while the caller is blocked on a remote operation, so they
//! should return quickly.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use slog::{debug, info, o, warn, Logger};

use crate::backend::Backend;
use crate::connection_pool::types::Limit;
use crate::managed_connection::RequestSnapshot;

/// A connection was created, checked out, or checked in.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionEvent<'a> {
    pub pool: &'a str,
    pub connection_id: u64,
    pub server: &'a Backend,
}

/// A connection was closed and will not be used again.
#[derive(Clone, Copy, Debug)]
pub struct DisposeEvent<'a> {
    pub pool: &'a str,
    pub connection_id: u64,
    pub server: &'a Backend,
    pub reason: &'a str,
    /// Set when closing the underlying connection failed. The connection is
    /// considered disposed either way.
    pub error: Option<&'a (dyn StdError + 'static)>,
}

/// A connection reached its recycle threshold and was swapped for a new one.
#[derive(Clone, Copy, Debug)]
pub struct RecycleEvent<'a> {
    pub pool: &'a str,
    pub old_connection_id: u64,
    pub old_server: &'a Backend,
    pub new_connection_id: u64,
    pub new_server: &'a Backend,
    pub operation_count: u64,
}

/// Opening a connection, or an operation on one, failed.
#[derive(Clone, Copy, Debug)]
pub struct FailureEvent<'a> {
    pub pool: &'a str,
    pub server: &'a Backend,
    /// `None` when the failure happened while opening a new connection.
    pub connection_id: Option<u64>,
    pub error: &'a (dyn StdError + 'static),
    /// The operation that was in flight, if any.
    pub request: Option<&'a RequestSnapshot>,
}

/// The server rotation was (re)loaded.
#[derive(Clone, Copy, Debug)]
pub struct ServerListEvent<'a> {
    pub pool: &'a str,
    pub servers: &'a [Backend],
}

/// An `acquire` timed out because every allowed connection was in use.
#[derive(Clone, Copy, Debug)]
pub struct PoolAtMaxEvent<'a> {
    pub pool: &'a str,
    pub pool_size: u32,
    pub max_overflow: Limit,
    pub live_connections: u32,
}

/// Pool lifecycle callbacks. Every method defaults to doing nothing.
pub trait PoolListener: Send + Sync {
    fn connection_created(&self, _event: &ConnectionEvent) {}
    fn connection_checked_out(&self, _event: &ConnectionEvent) {}
    fn connection_checked_in(&self, _event: &ConnectionEvent) {}
    fn connection_disposed(&self, _event: &DisposeEvent) {}
    fn connection_recycled(&self, _event: &RecycleEvent) {}
    fn connection_failed(&self, _event: &FailureEvent) {}
    fn server_list_obtained(&self, _event: &ServerListEvent) {}
    fn pool_disposed(&self, _pool: &str) {}
    fn pool_at_max(&self, _event: &PoolAtMaxEvent) {}
}

/// Fans each event out to every registered listener, in registration order.
pub struct ListenerHub {
    pool: String,
    listeners: RwLock<Vec<Arc<dyn PoolListener>>>,
}

impl std::fmt::Debug for ListenerHub {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ListenerHub")
            .field("pool", &self.pool)
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerHub {
    pub fn new<S: Into<String>>(pool: S) -> Self {
        ListenerHub {
            pool: pool.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn add(&self, listener: Arc<dyn PoolListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn each<F: Fn(&dyn PoolListener)>(&self, f: F) {
        // Snapshot so a listener may register another without deadlocking.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        listeners.iter().for_each(|l| f(l.as_ref()));
    }

    pub(crate) fn created(&self, connection_id: u64, server: &Backend) {
        let event = self.connection_event(connection_id, server);
        self.each(|l| l.connection_created(&event));
    }

    pub(crate) fn checked_out(&self, connection_id: u64, server: &Backend) {
        let event = self.connection_event(connection_id, server);
        self.each(|l| l.connection_checked_out(&event));
    }

    pub(crate) fn checked_in(&self, connection_id: u64, server: &Backend) {
        let event = self.connection_event(connection_id, server);
        self.each(|l| l.connection_checked_in(&event));
    }

    pub(crate) fn disposed(
        &self,
        connection_id: u64,
        server: &Backend,
        reason: &str,
        error: Option<&(dyn StdError + 'static)>,
    ) {
        let event = DisposeEvent {
            pool: &self.pool,
            connection_id,
            server,
            reason,
            error,
        };
        self.each(|l| l.connection_disposed(&event));
    }

    pub(crate) fn recycled(
        &self,
        old: (u64, &Backend),
        new: (u64, &Backend),
        operation_count: u64,
    ) {
        let event = RecycleEvent {
            pool: &self.pool,
            old_connection_id: old.0,
            old_server: old.1,
            new_connection_id: new.0,
            new_server: new.1,
            operation_count,
        };
        self.each(|l| l.connection_recycled(&event));
    }

    pub(crate) fn failed(
        &self,
        server: &Backend,
        connection_id: Option<u64>,
        error: &(dyn StdError + 'static),
        request: Option<&RequestSnapshot>,
    ) {
        let event = FailureEvent {
            pool: &self.pool,
            server,
            connection_id,
            error,
            request,
        };
        self.each(|l| l.connection_failed(&event));
    }

    pub(crate) fn server_list_obtained(&self, servers: &[Backend]) {
        let event = ServerListEvent {
            pool: &self.pool,
            servers,
        };
        self.each(|l| l.server_list_obtained(&event));
    }

    pub(crate) fn pool_disposed(&self) {
        self.each(|l| l.pool_disposed(&self.pool));
    }

    pub(crate) fn pool_at_max(
        &self,
        pool_size: u32,
        max_overflow: Limit,
        live_connections: u32,
    ) {
        let event = PoolAtMaxEvent {
            pool: &self.pool,
            pool_size,
            max_overflow,
            live_connections,
        };
        self.each(|l| l.pool_at_max(&event));
    }

    fn connection_event<'a>(
        &'a self,
        connection_id: u64,
        server: &'a Backend,
    ) -> ConnectionEvent<'a> {
        ConnectionEvent {
            pool: &self.pool,
            connection_id,
            server,
        }
    }
}

/// Writes every event to a `slog` logger.
#[derive(Debug)]
pub struct LogListener {
    log: Logger,
}

impl LogListener {
    pub fn new(log: &Logger) -> Self {
        LogListener {
            log: log.new(o!("component" => "pool-listener")),
        }
    }
}

impl PoolListener for LogListener {
    fn connection_created(&self, event: &ConnectionEvent) {
        debug!(self.log, "connection created";
            "pool" => event.pool,
            "connection" => event.connection_id,
            "server" => %event.server);
    }

    fn connection_checked_out(&self, event: &ConnectionEvent) {
        debug!(self.log, "connection checked out";
            "pool" => event.pool,
            "connection" => event.connection_id);
    }

    fn connection_checked_in(&self, event: &ConnectionEvent) {
        debug!(self.log, "connection checked in";
            "pool" => event.pool,
            "connection" => event.connection_id);
    }

    fn connection_disposed(&self, event: &DisposeEvent) {
        match event.error {
            Some(err) => warn!(self.log, "error closing connection";
                "pool" => event.pool,
                "connection" => event.connection_id,
                "server" => %event.server,
                "reason" => event.reason,
                "error" => %err),
            None => debug!(self.log, "connection disposed";
                "pool" => event.pool,
                "connection" => event.connection_id,
                "server" => %event.server,
                "reason" => event.reason),
        }
    }

    fn connection_recycled(&self, event: &RecycleEvent) {
        info!(self.log, "connection recycled";
            "pool" => event.pool,
            "old_connection" => event.old_connection_id,
            "new_connection" => event.new_connection_id,
            "new_server" => %event.new_server,
            "operations" => event.operation_count);
    }

    fn connection_failed(&self, event: &FailureEvent) {
        let operation = event.request.map(|r| r.operation.as_str());
        warn!(self.log, "connection failed";
            "pool" => event.pool,
            "server" => %event.server,
            "connection" => ?event.connection_id,
            "operation" => ?operation,
            "error" => %event.error);
    }

    fn server_list_obtained(&self, event: &ServerListEvent) {
        let servers: Vec<&str> =
            event.servers.iter().map(|s| s.name.as_str()).collect();
        info!(self.log, "server list obtained";
            "pool" => event.pool,
            "servers" => ?servers);
    }

    fn pool_disposed(&self, pool: &str) {
        info!(self.log, "pool disposed"; "pool" => pool);
    }

    fn pool_at_max(&self, event: &PoolAtMaxEvent) {
        warn!(self.log, "pool exhausted";
            "pool" => event.pool,
            "pool_size" => event.pool_size,
            "max_overflow" => %event.max_overflow,
            "live" => event.live_connections);
    }
}

/// Event counts collected by a [`StatsListener`](struct.StatsListener.html).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ListenerStats {
    pub created: u64,
    pub checked_out: u64,
    pub checked_in: u64,
    pub disposed: u64,
    pub recycled: u64,
    pub failed: u64,
    pub server_lists_obtained: u64,
    pub pools_disposed: u64,
    pub at_max: u64,
}

/// Counts every event it receives.
#[derive(Debug, Default)]
pub struct StatsListener {
    created: AtomicU64,
    checked_out: AtomicU64,
    checked_in: AtomicU64,
    disposed: AtomicU64,
    recycled: AtomicU64,
    failed: AtomicU64,
    server_lists_obtained: AtomicU64,
    pools_disposed: AtomicU64,
    at_max: AtomicU64,
}

impl StatsListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            created: self.created.load(Ordering::Relaxed),
            checked_out: self.checked_out.load(Ordering::Relaxed),
            checked_in: self.checked_in.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            server_lists_obtained: self
                .server_lists_obtained
                .load(Ordering::Relaxed),
            pools_disposed: self.pools_disposed.load(Ordering::Relaxed),
            at_max: self.at_max.load(Ordering::Relaxed),
        }
    }

    /// Connections opened but not yet disposed, as seen by this listener.
    pub fn open(&self) -> u64 {
        let stats = self.stats();
        stats.created.saturating_sub(stats.disposed)
    }
}

impl PoolListener for StatsListener {
    fn connection_created(&self, _event: &ConnectionEvent) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_checked_out(&self, _event: &ConnectionEvent) {
        self.checked_out.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_checked_in(&self, _event: &ConnectionEvent) {
        self.checked_in.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_disposed(&self, _event: &DisposeEvent) {
        self.disposed.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_recycled(&self, _event: &RecycleEvent) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_failed(&self, _event: &FailureEvent) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn server_list_obtained(&self, _event: &ServerListEvent) {
        self.server_lists_obtained.fetch_add(1, Ordering::Relaxed);
    }

    fn pool_disposed(&self, _pool: &str) {
        self.pools_disposed.fetch_add(1, Ordering::Relaxed);
    }

    fn pool_at_max(&self, _event: &PoolAtMaxEvent) {
        self.at_max.fetch_add(1, Ordering::Relaxed);
    }
}
