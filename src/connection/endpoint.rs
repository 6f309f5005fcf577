// src/connection/endpoint.rs

//! Value types identifying the server a connection talks to and the secret it
//! authenticates with.

use crate::core::ClientError;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// The address of a RESP server. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to the first socket address it maps to.
    ///
    /// Host names go through the system resolver, which may block.
    pub fn resolve(&self) -> Result<SocketAddr, ClientError> {
        if self.host.trim().is_empty() {
            return Err(ClientError::InvalidAddress(format!("{self}: empty host")));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::InvalidAddress(format!("{self}: {e}")))?
            .next()
            .ok_or_else(|| ClientError::InvalidAddress(format!("{self}: no addresses found")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An optional authentication secret. Its `Debug` output never shows the secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Option<String>);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Some(secret.into()))
    }

    pub fn secret(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

impl From<Option<String>> for Credential {
    fn from(secret: Option<String>) -> Self {
        Self(secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credential(<redacted>)"),
            None => f.write_str("Credential(None)"),
        }
    }
}
