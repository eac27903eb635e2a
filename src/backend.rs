// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;

use derive_more::{Display, From, Into};

use crate::error::Error;

/// The port used when a server address omits one.
pub const DEFAULT_PORT: BackendPort = 9160;

/// The port number for a backend. This is a type alias for u16.
pub type BackendPort = u16;
/// The host portion of a backend address. May be a hostname or an IP address
/// literal.
pub type BackendHost = String;

/// The concatenation of the backend host and port with a colon delimiter.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct BackendName(String);

impl BackendName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single server in the cluster that connections may be opened against.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Backend {
    /// The concatenation of the backend host and port with a colon delimiter.
    pub name: BackendName,
    /// The host of the backend.
    pub host: BackendHost,
    /// The port of the backend.
    pub port: BackendPort,
}

impl Backend {
    /// Return a new instance of `Backend` given a host and `BackendPort`.
    pub fn new<H: Into<BackendHost>>(host: H, port: BackendPort) -> Self {
        let host = host.into();
        Backend {
            name: backend_name(&host, port),
            host,
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(fmt)
    }
}

/// Parses `host`, `host:port`, `[v6addr]` or `[v6addr]:port`. A missing port
/// falls back to `DEFAULT_PORT`.
impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidServer(s.to_string());
        let s_trimmed = s.trim();

        if let Some(rest) = s_trimmed.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(invalid)?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => DEFAULT_PORT,
                tail => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)
                    .ok_or_else(invalid)?,
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Backend::new(host, port));
        }

        let (host, port) = match s_trimmed.rsplit_once(':') {
            Some((host, port)) => {
                (host, parse_port(port).ok_or_else(invalid)?)
            }
            None => (s_trimmed, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains(':') {
            return Err(invalid());
        }
        Ok(Backend::new(host, port))
    }
}

fn parse_port(port: &str) -> Option<BackendPort> {
    port.parse::<BackendPort>().ok().filter(|p| *p != 0)
}

// Concatentate the backend host and port with a colon delimiter. IPv6
// literals are bracketed so the name parses back to the same backend.
fn backend_name(host: &str, port: BackendPort) -> BackendName {
    if host.contains(':') {
        format!("[{}]:{}", host, port).into()
    } else {
        [host, ":", &port.to_string()].concat().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let b: Backend = "db1.example.com:9042".parse().unwrap();
        assert_eq!(b.host, "db1.example.com");
        assert_eq!(b.port, 9042);
        assert_eq!(b.name.as_str(), "db1.example.com:9042");
    }

    #[test]
    fn parse_default_port() {
        let b: Backend = "localhost".parse().unwrap();
        assert_eq!(b.port, DEFAULT_PORT);
        assert_eq!(b.to_string(), "localhost:9160");
    }

    #[test]
    fn parse_ipv6() {
        let b: Backend = "[::1]:7000".parse().unwrap();
        assert_eq!(b.host, "::1");
        assert_eq!(b.port, 7000);
        assert_eq!(b.to_string(), "[::1]:7000");

        let b: Backend = "[fe80::1]".parse().unwrap();
        assert_eq!(b.port, DEFAULT_PORT);
    }

    #[test]
    fn parse_invalid() {
        for s in &["", ":9160", "host:", "host:notaport", "host:0", "a:b:c"] {
            let result = s.parse::<Backend>();
            assert!(
                matches!(result, Err(Error::InvalidServer(_))),
                "expected {:?} to be rejected",
                s
            );
        }
    }
}
