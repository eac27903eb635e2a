// Copyright 2020 Joyent, Inc.

//! A client-side connection pool for multi-node RPC data stores
//!
//! Rotapool manages connections to a cluster of servers that speak a
//! stateful, one-request-at-a-time RPC protocol. Callers acquire a
//! connection, issue remote operations through the pool, and release the
//! connection again; server selection, connection lifecycle, and recovery
//! from transient failures are handled by the pool.
//!
//! ## Connections
//!
//! A *connection* is anything that implements the
//! [`Connection`](connection/trait.Connection.html) trait: it can be opened
//! against a server, optionally authenticated and bound to a namespace,
//! asked to perform a named operation, and closed. Each error a connection
//! returns is classified through the
//! [`Classify`](connection/trait.Classify.html) trait as either an
//! *application* error (the server rejected the request) or a *transient*
//! error (timeout, unavailable replica, broken socket).
//!
//! Users also provide the pool with a function that builds an unopened
//! connection for a given server:
//! ```rust,ignore
//! Fn(&Backend) -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//! This is where application configuration, such as protocol options, is
//! captured.
//!
//! ## Server rotation
//!
//! The pool is given a list of `host:port` addresses, or a function returning
//! one. The list is shuffled once and new connections are opened against
//! its servers in round-robin order. If opening fails the next server is
//! tried, visiting each server at most twice before giving up. The list can
//! be replaced at any time with `ConnectionPool::set_server_list`.
//!
//! ## Sizing
//!
//! Up to `pool_size` connections are kept open and idle. When demand
//! exceeds that, up to `max_overflow` additional connections are opened;
//! they are closed again as they are released. Once every allowed connection
//! is in use `acquire` waits up to `pool_timeout` for one to come back.
//! Connections that have served `recycle` operations are replaced when
//! released.
//!
//! ## Retries and failover
//!
//! Operations issued with `ConnectionPool::invoke` or
//! `ConnectionPool::execute` are retried when they fail transiently: the
//! failed connection is closed, the pool waits with exponential backoff,
//! and the operation is repeated on a fresh connection, normally to the
//! next server in the rotation. The caller's
//! [`ManagedConnection`](managed_connection/struct.ManagedConnection.html)
//! handle transparently takes over the fresh connection. Application errors
//! are never retried.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use rotapool::connection_pool::types::ConnectionPoolOptions;
//! use rotapool::connection_pool::ConnectionPool;
//! use rotapool::listener::StatsListener;
//!
//! let pool_opts = ConnectionPoolOptions {
//!     pool_size: 4,
//!     namespace: Some(String::from("inventory")),
//!     ..ConnectionPoolOptions::default()
//! };
//!
//! let pool = ConnectionPool::new(
//!     pool_opts,
//!     vec!["10.0.0.1:9160", "10.0.0.2:9160", "10.0.0.3:9160"],
//!     ThriftConnection::new,
//! )?;
//! let stats = Arc::new(StatsListener::new());
//! pool.add_listener(stats.clone());
//!
//! let reply = pool.execute("get", &request)?;
//!
//! let conn = pool.acquire()?;
//! pool.invoke(&conn, "insert", &mutation)?;
//! pool.invoke_once(&conn, "add", &counter_update)?;
//! pool.release(conn)?;
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod invoker;
pub mod listener;
pub mod managed_connection;
pub mod rotation;
