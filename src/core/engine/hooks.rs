// src/core/engine/hooks.rs

//! The event-hook interface through which the protocol engine declares what I/O it
//! needs next. Whoever drives the engine from a reactor implements it.

/// Interest-change notifications emitted by `AsyncContext`.
///
/// All methods are called on the thread that drives the engine. Each call is a
/// request for exactly one subscription change.
pub trait EventHooks: Send + Sync {
    /// The engine has buffered output and wants to be told when the socket is writable.
    fn on_add_write(&self);
    /// The outbound buffer is drained.
    fn on_del_write(&self);
    /// The engine wants to be told when the socket is readable.
    fn on_add_read(&self);
    fn on_del_read(&self);
    /// The engine is being torn down. Must not touch engine state.
    fn on_cleanup(&self);
}
