// src/reactor/mod.rs

//! The single-threaded reactor that drives every client connection: an `EventLoop`
//! running on its own thread, and `Channel` subscriptions for individual sockets.

mod channel;
mod event_loop;

pub use channel::{Channel, EventCallback};
pub use event_loop::{EventLoop, EventLoopThread};
