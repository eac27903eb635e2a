// Copyright 2020 Joyent, Inc.

//! Failure classification and failover for remote operations.

use std::thread;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{debug, warn};

use crate::connection::{Classify, Connection, FailureKind};
use crate::connection_pool::types::Limit;
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::managed_connection::{InvokeError, ManagedConnection};

/// The backoff schedule of one retry loop: the delay before retry `n` (1 for
/// the first retry) is `base * 2^n`, capped at `max`, without jitter.
pub fn retry_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    let initial = base.checked_mul(2).map_or(max, |d| d.min(max));
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Runs a remote operation on a `ManagedConnection`, replacing the
/// connection and retrying when it fails transiently.
///
/// - Success resets the connection's retry count.
/// - An application-level error disposes the connection and is returned
///   immediately as `Error::Application`.
/// - A transient error is reported to the pool listeners, the connection is
///   disposed, and, unless retries are disallowed or `max_retries` has been
///   exceeded, the loop sleeps (exponential backoff), takes a fresh
///   connection from the pool, swaps it into the caller's handle and tries
///   again. Running out of retries yields `Error::RetriesExhausted`.
///
/// At most one attempt is in flight per call.
#[derive(Debug)]
pub struct RetryableInvoker<'a, C: Connection> {
    pool: &'a ConnectionPool<C>,
    max_retries: Limit,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl<'a, C: Connection> RetryableInvoker<'a, C> {
    /// An invoker using the pool's retry and backoff settings.
    pub fn new(pool: &'a ConnectionPool<C>) -> Self {
        let options = pool.options();
        RetryableInvoker {
            pool,
            max_retries: options.max_retries,
            base_backoff: options.base_backoff,
            max_backoff: options.max_backoff,
        }
    }

    pub fn max_retries(mut self, max_retries: Limit) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn invoke(
        &self,
        conn: &ManagedConnection<C>,
        operation: &str,
        args: &C::Args,
        allow_retries: bool,
    ) -> Result<C::Reply, Error> {
        let log = self.pool.log();
        let mut backoff = retry_backoff(self.base_backoff, self.max_backoff);
        loop {
            let err = match conn.invoke(operation, args) {
                Ok(reply) => {
                    conn.reset_retry_count();
                    return Ok(reply);
                }
                Err(InvokeError::Lifecycle(err)) => return Err(err),
                Err(InvokeError::Remote(err)) => err,
            };

            if err.kind() == FailureKind::Application {
                debug!(log, "operation rejected by server";
                    "operation" => operation,
                    "connection" => conn.id(),
                    "error" => %err);
                self.pool.discard(conn, "application error");
                return Err(Error::Application(Box::new(err)));
            }

            let server = conn.server();
            let request = conn.last_request();
            warn!(log, "operation failed";
                "operation" => operation,
                "connection" => conn.id(),
                "server" => %server,
                "error" => %err);
            self.pool.listeners().failed(
                &server,
                Some(conn.id()),
                &err,
                request.as_ref(),
            );
            self.pool.discard(conn, "transient failure");

            let retry_count = conn.increment_retry_count();
            if !allow_retries
                || self.max_retries.exceeded_by(u64::from(retry_count))
            {
                return Err(Error::RetriesExhausted {
                    attempts: retry_count,
                    source: Box::new(err),
                });
            }

            // Never exhausted: there is no max_elapsed_time.
            let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
            debug!(log, "retrying operation";
                "operation" => operation,
                "retry" => retry_count,
                "delay" => ?delay);
            thread::sleep(delay);

            let fresh = self.pool.checkout_connection()?;
            conn.replace_with(fresh);
            self.pool.pin(conn);
        }
    }
}
