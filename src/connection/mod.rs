// src/connection/mod.rs

//! A single pipelined client connection to a RESP server, driven by the reactor.

mod bridge;
mod client;
mod endpoint;
mod pipeline;
mod status;

pub use bridge::EventBridge;
pub use client::{ClientConnection, ConnectionHandler, ConnectionHandlers, ConnectionOptions};
pub use endpoint::{Credential, Endpoint};
pub use pipeline::{CommandPipeline, FailureContinuation, PendingCommand, SuccessContinuation};
pub use status::ConnectStatus;
