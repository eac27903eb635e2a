// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::{Connection, Credentials};
use crate::managed_connection::ManagedConnection;

// Default number of idle connections kept by the pool
pub const DEFAULT_POOL_SIZE: u32 = 5;
// Default number of connections allowed beyond the pool size
pub const DEFAULT_MAX_OVERFLOW: u32 = 10;
// Default acquire timeout in seconds
pub const DEFAULT_POOL_TIMEOUT: u64 = 30;
// Default number of operations after which a connection is replaced
pub const DEFAULT_RECYCLE: u32 = 10_000;
// Default number of retries of a transiently failing operation
pub const DEFAULT_MAX_RETRIES: u32 = 5;
// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 500;
// Default backoff base in milliseconds
pub const DEFAULT_BASE_BACKOFF: u64 = 10;
// Default backoff ceiling in milliseconds
pub const DEFAULT_MAX_BACKOFF: u64 = 5_000;
// Default pool name used in logs and listener events
pub const DEFAULT_POOL_NAME: &str = "rotapool";

/// An optional upper bound on a count.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Limit {
    Bounded(u32),
    Unbounded,
}

impl Limit {
    /// Whether `value` is strictly greater than the limit.
    pub fn exceeded_by(self, value: u64) -> bool {
        match self {
            Limit::Bounded(max) => value > u64::from(max),
            Limit::Unbounded => false,
        }
    }

    /// `base + self`, or `None` when unbounded.
    pub fn added_to(self, base: u32) -> Option<u32> {
        match self {
            Limit::Bounded(n) => Some(base.saturating_add(n)),
            Limit::Unbounded => None,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Limit::Bounded(n) => n.fmt(fmt),
            Limit::Unbounded => String::from("unbounded").fmt(fmt),
        }
    }
}

impl From<u32> for Limit {
    fn from(n: u32) -> Self {
        Limit::Bounded(n)
    }
}

/// The configuration options for a connection pool. Every field has a
/// default; use struct update syntax to override only what is needed:
///
/// ```rust
/// use std::time::Duration;
/// use rotapool::connection_pool::types::{ConnectionPoolOptions, Limit};
///
/// let opts = ConnectionPoolOptions {
///     pool_size: 2,
///     max_overflow: Limit::Unbounded,
///     pool_timeout: Some(Duration::from_millis(250)),
///     ..ConnectionPoolOptions::default()
/// };
/// assert_eq!(opts.max_retries, Limit::Bounded(5));
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionPoolOptions {
    /// The number of connections kept open and idle in the pool. The default
    /// is 5.
    pub pool_size: u32,
    /// How many connections may be opened beyond `pool_size` to absorb bursts
    /// of demand. They are closed again as they are released. The default is
    /// 10.
    pub max_overflow: Limit,
    /// How long `acquire` may block waiting for a connection. `Some(ZERO)`
    /// fails immediately and `None` waits forever. The default is 30
    /// seconds.
    pub pool_timeout: Option<Duration>,
    /// Connections that have served more than this many operations are
    /// replaced when they are released. `Unbounded` disables recycling. The
    /// default is 10000.
    pub recycle: Limit,
    /// How many times a transiently failing operation is retried on a fresh
    /// connection. `Bounded(0)` disables retries and `Unbounded` retries
    /// forever. The default is 5.
    pub max_retries: Limit,
    /// Pin one connection to each thread: repeated `acquire` calls on a
    /// thread return the same connection until it is released.
    pub sticky: bool,
    /// Open `pool_size` connections when the pool is created. The default is
    /// true.
    pub prefill: bool,
    /// Passed to `Connection::connect`. The default is 500 milliseconds.
    pub connect_timeout: Option<Duration>,
    /// When set, every new connection is authenticated with these.
    pub credentials: Option<Credentials>,
    /// When set, every new connection is bound to this namespace.
    pub namespace: Option<String>,
    /// The delay before the first retry is twice this value, doubling with
    /// each further retry. The default is 10 milliseconds.
    pub base_backoff: Duration,
    /// Upper bound on a single backoff delay. The default is 5 seconds.
    pub max_backoff: Duration,
    /// Identifies the pool in logs and listener events.
    pub name: String,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        ConnectionPoolOptions {
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: Limit::Bounded(DEFAULT_MAX_OVERFLOW),
            pool_timeout: Some(Duration::from_secs(DEFAULT_POOL_TIMEOUT)),
            recycle: Limit::Bounded(DEFAULT_RECYCLE),
            max_retries: Limit::Bounded(DEFAULT_MAX_RETRIES),
            sticky: false,
            prefill: true,
            connect_timeout: Some(Duration::from_millis(
                DEFAULT_CONNECT_TIMEOUT,
            )),
            credentials: None,
            namespace: None,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF),
            name: String::from(DEFAULT_POOL_NAME),
            log: None,
        }
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A point-in-time view of the pool's accounting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// Open connections owned by the pool, idle or checked out.
    pub live_connections: ConnectionCount,
    /// Connections waiting in the idle queue.
    pub idle_connections: ConnectionCount,
    /// Connections currently held by callers.
    pub checked_out_connections: ConnectionCount,
    /// Live connections beyond `pool_size`.
    pub overflow_connections: ConnectionCount,
    /// Threads with a pinned connection (sticky mode only).
    pub pinned_threads: ConnectionCount,
}

/// Sum type representing the current state of the connection pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is able to service acquire requests.
    Active,
    /// The pool has been disposed and rejects acquire requests.
    Disposed,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Active => String::from("active").fmt(fmt),
            ConnectionPoolState::Disposed => {
                String::from("disposed").fmt(fmt)
            }
        }
    }
}

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionData<C: Connection> {
    pub idle: VecDeque<ManagedConnection<C>>,
    pub live_count: ConnectionCount,
    pub pinned: HashMap<ThreadId, ManagedConnection<C>>,
    pub state: ConnectionPoolState,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new(pool_size: usize) -> Self {
        ConnectionData {
            idle: VecDeque::with_capacity(pool_size),
            live_count: ConnectionCount::from(0),
            pinned: HashMap::new(),
            state: ConnectionPoolState::Active,
        }
    }

    pub fn idle_count(&self) -> ConnectionCount {
        ConnectionCount::from(self.idle.len() as u32)
    }
}

// Protected access to the internal connection pool data structures. The
// condition variable is signalled whenever a connection is enqueued or a
// live slot is freed.
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<C: Connection>(Arc<(Mutex<ConnectionData<C>>, Condvar)>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a notification until `deadline`. `None` waits indefinitely.
    /// The returned flag is true once the deadline has passed.
    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, ConnectionData<C>>, bool) {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (g, true);
                }
                let (g, _) = (self.0)
                    .1
                    .wait_timeout(g, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (g, Instant::now() >= deadline)
            }
            None => (
                (self.0).1.wait(g).unwrap_or_else(PoisonError::into_inner),
                false,
            ),
        }
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}
