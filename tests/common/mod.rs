// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Logger};

use rotapool::backend::Backend;
use rotapool::connection::{Classify, Connection, Credentials, FailureKind};
use rotapool::connection_pool::types::{ConnectionPoolOptions, Limit};

#[derive(Clone, Debug, PartialEq)]
pub enum FakeError {
    Timeout,
    Refused,
    Rejected(String),
}

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FakeError::Timeout => write!(f, "operation timed out"),
            FakeError::Refused => write!(f, "connection refused"),
            FakeError::Rejected(why) => write!(f, "invalid request: {}", why),
        }
    }
}

impl StdError for FakeError {}

impl Classify for FakeError {
    fn kind(&self) -> FailureKind {
        match self {
            FakeError::Rejected(_) => FailureKind::Application,
            _ => FailureKind::Transient,
        }
    }
}

/// Shared, scriptable behavior of every fake server.
#[derive(Debug, Default)]
pub struct Cluster {
    /// Errors returned by the next invocations, on any server.
    pub script: Mutex<VecDeque<FakeError>>,
    /// Every invocation fails with a timeout.
    pub fail_everything: AtomicBool,
    /// Invocations against these servers time out.
    pub broken_servers: Mutex<HashSet<String>>,
    /// Connecting to these servers is refused.
    pub refusing_servers: Mutex<HashSet<String>>,
    /// Authentication is rejected.
    pub reject_auth: AtomicBool,
    pub invocations: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Setup calls in the order they were made, e.g. "connect a:1".
    pub setup_calls: Mutex<Vec<String>>,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Cluster::default())
    }

    pub fn fail_next(&self, errors: Vec<FakeError>) {
        self.script.lock().unwrap().extend(errors);
    }

    pub fn break_server(&self, server: &str) {
        self.broken_servers.lock().unwrap().insert(server.to_string());
    }

    pub fn refuse_server(&self, server: &str) {
        self.refusing_servers
            .lock()
            .unwrap()
            .insert(server.to_string());
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    server: Backend,
    cluster: Arc<Cluster>,
    connected: bool,
}

impl FakeConnection {
    pub fn connector(
        cluster: &Arc<Cluster>,
    ) -> impl Fn(&Backend) -> FakeConnection + Send + Sync + 'static {
        let cluster = Arc::clone(cluster);
        move |b| FakeConnection {
            server: b.clone(),
            cluster: Arc::clone(&cluster),
            connected: false,
        }
    }

    fn record(&self, call: &str) {
        self.cluster
            .setup_calls
            .lock()
            .unwrap()
            .push(format!("{} {}", call, self.server));
    }
}

impl Connection for FakeConnection {
    type Args = String;
    type Reply = String;
    type Error = FakeError;

    fn connect(&mut self, _timeout: Option<Duration>) -> Result<(), FakeError> {
        self.record("connect");
        if self
            .cluster
            .refusing_servers
            .lock()
            .unwrap()
            .contains(self.server.name.as_str())
        {
            return Err(FakeError::Refused);
        }
        self.cluster.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    fn authenticate(
        &mut self,
        credentials: &Credentials,
    ) -> Result<(), FakeError> {
        self.record("authenticate");
        if self.cluster.reject_auth.load(Ordering::SeqCst)
            || !credentials.contains_key("username")
        {
            return Err(FakeError::Rejected(String::from("bad credentials")));
        }
        Ok(())
    }

    fn select_namespace(&mut self, name: &str) -> Result<(), FakeError> {
        self.record(&format!("select_namespace {}", name));
        Ok(())
    }

    fn invoke(&mut self, op: &str, args: &String) -> Result<String, FakeError> {
        assert!(self.connected, "invoke on a closed connection");
        self.cluster.invocations.fetch_add(1, Ordering::SeqCst);

        if self.cluster.fail_everything.load(Ordering::SeqCst) {
            return Err(FakeError::Timeout);
        }
        if let Some(err) = self.cluster.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self
            .cluster
            .broken_servers
            .lock()
            .unwrap()
            .contains(self.server.name.as_str())
        {
            return Err(FakeError::Timeout);
        }
        Ok(format!("{} {}({})", self.server, op, args))
    }

    fn close(&mut self) -> Result<(), FakeError> {
        assert!(self.connected, "close on a closed connection");
        self.cluster.closes.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }
}

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// Small pool, no prefill, fast backoff.
pub fn options(pool_size: u32, max_overflow: u32) -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        pool_size,
        max_overflow: Limit::Bounded(max_overflow),
        pool_timeout: Some(Duration::from_secs(1)),
        prefill: false,
        base_backoff: Duration::from_millis(1),
        log: Some(test_logger()),
        ..ConnectionPoolOptions::default()
    }
}
