// src/core/mod.rs

//! The protocol layer of the client: the error type, the RESP codec and the
//! non-blocking protocol engine.

pub mod engine;
pub mod errors;
pub mod protocol;

pub use errors::ClientError;
pub use protocol::RespValue;
