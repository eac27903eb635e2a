// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use rotapool::backend::Backend;
use rotapool::connection::{Classify, Connection, FailureKind};
use rotapool::connection_pool::types::{ConnectionPoolOptions, Limit};
use rotapool::connection_pool::ConnectionPool;
use rotapool::listener::{LogListener, StatsListener};

#[derive(Debug)]
pub enum KvError {
    NotFound(String),
    Unavailable(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KvError::NotFound(key) => write!(f, "no such key: {}", key),
            KvError::Unavailable(server) => {
                write!(f, "replica {} unavailable", server)
            }
        }
    }
}

impl StdError for KvError {}

impl Classify for KvError {
    fn kind(&self) -> FailureKind {
        match self {
            KvError::NotFound(_) => FailureKind::Application,
            KvError::Unavailable(_) => FailureKind::Transient,
        }
    }
}

/// Data shared by every replica. One replica drops every third request.
#[derive(Debug, Default)]
pub struct Store {
    data: Mutex<HashMap<String, String>>,
    requests: AtomicUsize,
}

#[derive(Debug)]
pub struct KvConnection {
    server: Backend,
    store: Arc<Store>,
    flaky: bool,
}

impl Connection for KvConnection {
    type Args = (String, Option<String>);
    type Reply = Option<String>;
    type Error = KvError;

    fn connect(&mut self, _timeout: Option<Duration>) -> Result<(), KvError> {
        Ok(())
    }

    fn invoke(
        &mut self,
        op: &str,
        args: &(String, Option<String>),
    ) -> Result<Option<String>, KvError> {
        let n = self.store.requests.fetch_add(1, Ordering::SeqCst);
        if self.flaky && n % 3 == 0 {
            return Err(KvError::Unavailable(self.server.to_string()));
        }

        let mut data = self.store.data.lock().unwrap();
        let (key, value) = args;
        match (op, value) {
            ("put", Some(value)) => Ok(data.insert(key.clone(), value.clone())),
            ("get", _) => data
                .get(key)
                .cloned()
                .map(Some)
                .ok_or_else(|| KvError::NotFound(key.clone())),
            _ => Err(KvError::NotFound(op.to_string())),
        }
    }

    fn close(&mut self) -> Result<(), KvError> {
        Ok(())
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic rotapool example");

    let store = Arc::new(Store::default());
    let store_clone = store.clone();
    let create_connection = move |b: &Backend| KvConnection {
        server: b.clone(),
        store: store_clone.clone(),
        flaky: b.port == 9162,
    };

    let pool_opts = ConnectionPoolOptions {
        pool_size: 3,
        max_overflow: Limit::Bounded(1),
        pool_timeout: Some(Duration::from_secs(1)),
        max_retries: Limit::Bounded(3),
        name: String::from("kv-example"),
        log: Some(log.clone()),
        ..ConnectionPoolOptions::default()
    };

    let stats = Arc::new(StatsListener::new());
    let pool = ConnectionPool::with_listeners(
        pool_opts,
        vec!["127.0.0.1:9160", "127.0.0.1:9161", "127.0.0.1:9162"],
        create_connection,
        vec![stats.clone(), Arc::new(LogListener::new(&log))],
    )
    .expect("failed to create connection pool");

    // Four writers against three pooled connections: one overflow connection
    // gets opened and closed again.
    let barrier = Arc::new(Barrier::new(4));
    let writers: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let conn = pool.acquire().expect("acquire");
                barrier.wait();
                for i in 0..5 {
                    let args = (format!("key-{}-{}", t, i), Some(i.to_string()));
                    pool.invoke(&conn, "put", &args).expect("put");
                }
                pool.release(conn).expect("release");
            })
        })
        .collect();
    for w in writers {
        let _ = w.join();
    }

    let value = pool
        .execute("get", &(String::from("key-2-4"), None))
        .expect("get");
    info!(log, "read back"; "key" => "key-2-4", "value" => ?value);

    let missing = pool.execute("get", &(String::from("nope"), None));
    info!(log, "missing key"; "result" => ?missing.map_err(|e| e.to_string()));

    info!(log, "pool stats";
        "pool" => ?pool.stats(),
        "events" => ?stats.stats());

    pool.dispose();
}
