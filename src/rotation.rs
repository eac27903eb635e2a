// Copyright 2020 Joyent, Inc.

//! Round-robin server selection.
//!
//! The pool consults a [`ServerRotation`](struct.ServerRotation.html) only
//! when it opens a new connection. The rotation does not track server health:
//! a server that keeps failing is simply skipped over by the retry loop as
//! the cursor moves on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use slog::{debug, Logger};

use crate::backend::Backend;
use crate::error::Error;
use crate::listener::ListenerHub;

/// A zero-argument function producing the current server list.
pub type ServerProvider = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Where the rotation gets its server addresses from.
#[derive(Clone)]
pub enum ServerSource {
    /// A fixed list of `host[:port]` addresses.
    List(Vec<String>),
    /// A function queried on every refresh.
    Provider(ServerProvider),
}

impl ServerSource {
    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        ServerSource::Provider(Arc::new(f))
    }

    fn resolve(&self) -> Vec<String> {
        match self {
            ServerSource::List(list) => list.clone(),
            ServerSource::Provider(provider) => provider(),
        }
    }
}

impl fmt::Debug for ServerSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerSource::List(list) => f.debug_tuple("List").field(list).finish(),
            ServerSource::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

impl From<Vec<String>> for ServerSource {
    fn from(list: Vec<String>) -> Self {
        ServerSource::List(list)
    }
}

impl From<Vec<&str>> for ServerSource {
    fn from(list: Vec<&str>) -> Self {
        ServerSource::List(list.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for ServerSource {
    fn from(list: &[&str]) -> Self {
        ServerSource::List(list.iter().map(|s| s.to_string()).collect())
    }
}

/// A shuffled server list and a cursor into it.
pub struct ServerRotation {
    servers: RwLock<Vec<Backend>>,
    cursor: AtomicUsize,
    source: RwLock<ServerSource>,
    hub: Arc<ListenerHub>,
    log: Logger,
}

impl fmt::Debug for ServerRotation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerRotation")
            .field("servers", &self.servers())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServerRotation {
    /// Build a rotation from `source`. An empty or malformed list is
    /// rejected here rather than on first use.
    pub fn new(
        source: ServerSource,
        hub: Arc<ListenerHub>,
        log: Logger,
    ) -> Result<Self, Error> {
        let servers = parse_servers(&source.resolve())?;
        let rotation = ServerRotation {
            servers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            source: RwLock::new(source),
            hub,
            log,
        };
        rotation.install(servers);
        Ok(rotation)
    }

    /// The next server in the rotation, wrapping around at the end.
    pub fn next(&self) -> Backend {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        // The list is never empty; construction and refresh both reject
        // empty lists.
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers[idx].clone()
    }

    /// Replace the server list and reset the cursor. On error the previous
    /// list stays in effect.
    pub fn refresh(&self, source: ServerSource) -> Result<(), Error> {
        let servers = parse_servers(&source.resolve())?;
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = source;
        self.install(servers);
        Ok(())
    }

    /// Query the current source again. Mostly useful with a provider.
    pub fn reload(&self) -> Result<(), Error> {
        let source = self
            .source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let servers = parse_servers(&source.resolve())?;
        self.install(servers);
        Ok(())
    }

    /// The servers in rotation order.
    pub fn servers(&self) -> Vec<Backend> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(&self, mut servers: Vec<Backend>) {
        shuffle(&mut servers, &mut rand::thread_rng());
        {
            let mut current =
                self.servers.write().unwrap_or_else(PoisonError::into_inner);
            *current = servers.clone();
            self.cursor.store(0, Ordering::Relaxed);
        }
        debug!(self.log, "server list installed"; "count" => servers.len());
        self.hub.server_list_obtained(&servers);
    }
}

fn parse_servers(list: &[String]) -> Result<Vec<Backend>, Error> {
    if list.is_empty() {
        return Err(Error::NoServers);
    }
    list.iter().map(|s| s.parse::<Backend>()).collect()
}

/// Fisher-Yates shuffle
fn shuffle<T, R>(items: &mut [T], rng: &mut R)
where
    R: Rng,
{
    let mut i = items.len();
    while i > 1 {
        i -= 1;
        let new_idx = rng.gen_range(0..=i);
        items.swap(i, new_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use quickcheck::{quickcheck, TestResult};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use slog::{o, Discard};

    fn rotation(servers: Vec<String>) -> Result<ServerRotation, Error> {
        ServerRotation::new(
            servers.into(),
            Arc::new(ListenerHub::new("test")),
            Logger::root(Discard, o!()),
        )
    }

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{}:9160", i + 1)).collect()
    }

    quickcheck! {
        fn round_robin_covers_every_server(n: u8, rounds: u8) -> TestResult {
            let n = (n % 16) as usize;
            let rounds = (rounds % 8) as usize;
            if n == 0 || rounds == 0 {
                return TestResult::discard();
            }
            let rot = rotation(addresses(n)).unwrap();
            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..(n * rounds) {
                *counts.entry(rot.next().to_string()).or_insert(0) += 1;
            }
            TestResult::from_bool(
                counts.len() == n && counts.values().all(|c| *c == rounds),
            )
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut items: Vec<u32> = (0..50).collect();
        shuffle(&mut items, &mut rng);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn empty_list_rejected() {
        assert!(matches!(rotation(vec![]), Err(Error::NoServers)));
        assert!(matches!(
            rotation(vec![String::from("host:bad")]),
            Err(Error::InvalidServer(_))
        ));
    }

    #[test]
    fn refresh_resets_cursor_and_keeps_old_list_on_error() {
        let rot = rotation(addresses(3)).unwrap();
        rot.next();
        rot.next();

        rot.refresh(vec!["a:1", "b:2"].into()).unwrap();
        assert_eq!(rot.len(), 2);
        let order = rot.servers();
        assert_eq!(rot.next(), order[0]);
        assert_eq!(rot.next(), order[1]);
        assert_eq!(rot.next(), order[0]);

        assert!(rot.refresh(Vec::<String>::new().into()).is_err());
        assert_eq!(rot.len(), 2);
    }

    #[test]
    fn provider_is_queried_on_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let source = ServerSource::provider(move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
            (0..n).map(|i| format!("host{}:9160", i)).collect()
        });
        let rot = ServerRotation::new(
            source,
            Arc::new(ListenerHub::new("test")),
            Logger::root(Discard, o!()),
        )
        .unwrap();
        assert_eq!(rot.len(), 1);
        rot.reload().unwrap();
        assert_eq!(rot.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_next_stays_in_bounds() {
        let rot = Arc::new(rotation(addresses(3)).unwrap());
        let servers = rot.servers();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rot = rot.clone();
                thread::spawn(move || {
                    (0..300).map(|_| rot.next()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut counts: HashMap<Backend, usize> = HashMap::new();
        for h in handles {
            for b in h.join().unwrap() {
                *counts.entry(b).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        assert!(servers.iter().all(|s| counts[s] == 400));
    }
}
