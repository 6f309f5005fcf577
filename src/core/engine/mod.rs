// src/core/engine/mod.rs

//! The protocol engine: a non-blocking RESP connection that buffers formatted
//! commands, parses replies, and announces its I/O needs through `EventHooks`.

mod context;
mod hooks;

pub use context::{AsyncContext, ContextFlags, ReplyCallback, StatusCallback};
pub use hooks::EventHooks;
