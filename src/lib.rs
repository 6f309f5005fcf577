// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod reactor;

// Re-export
pub use crate::connection::{ClientConnection, ConnectStatus, ConnectionHandlers, Endpoint};
pub use crate::core::{ClientError, RespValue};
