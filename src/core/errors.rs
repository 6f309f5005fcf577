// src/core/errors.rs

//! Defines the primary error type for the client connection.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, covering connection-level, command-level and codec failures.
///
/// The enum is `Clone` so that a single failure (for example a dropped socket) can be
/// delivered to every outstanding command and to the disconnect handler.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The codec needs more bytes before a full frame is available.
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error reply sent by the server. The payload is the reply text, verbatim.
    #[error("{0}")]
    Server(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl ClientError {
    /// Returns true for failures that concern the transport rather than a single command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}
