// src/connection/bridge.rs

//! Defines `EventBridge`, which couples a protocol engine to a reactor channel.
//!
//! In one direction it turns readiness on the socket into calls to the engine's read
//! and write pumps. In the other it implements `EventHooks`, turning the engine's
//! declared I/O needs into channel interest changes.

use crate::core::engine::{AsyncContext, EventHooks};
use crate::reactor::{Channel, EventLoop};
use std::sync::{Arc, Weak};
use tracing::trace;

pub struct EventBridge {
    channel: Arc<Channel>,
    /// Routing only. The connection owns the engine.
    context: Weak<AsyncContext>,
}

impl EventBridge {
    /// Creates a bridge over the engine's socket. Must run on the loop thread.
    pub fn new(event_loop: &EventLoop, context: &Arc<AsyncContext>) -> Arc<Self> {
        let bridge = Arc::new(Self {
            channel: Channel::new(event_loop, context.fd()),
            context: Arc::downgrade(context),
        });

        let weak = Arc::downgrade(&bridge);
        bridge.channel.set_read_callback({
            let weak = weak.clone();
            move || {
                if let Some(bridge) = weak.upgrade() {
                    bridge.on_readable();
                }
            }
        });
        bridge.channel.set_write_callback(move || {
            if let Some(bridge) = weak.upgrade() {
                bridge.on_writable();
            }
        });
        bridge
    }

    /// Drives the engine's read pump.
    pub fn on_readable(&self) {
        if let Some(context) = self.context.upgrade() {
            context.handle_read();
        }
    }

    /// Drives the engine's write pump. A disconnecting engine with no replies left to
    /// wait for has no further use for the socket, so the subscription goes first.
    ///
    /// The engine tears itself down as soon as its last reply arrives, so this only
    /// triggers for a writable event that reaches an engine already torn down, such
    /// as a readiness event delivered later in the same poll batch. While replies are
    /// outstanding the subscription stays, or they could never be read.
    pub fn on_writable(&self) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        if context.is_disconnecting() && context.pending_replies() == 0 {
            self.remove();
        }
        context.handle_write();
    }

    /// Drops all interest and detaches from the reactor. Idempotent.
    pub fn remove(&self) {
        if self.channel.is_removed() {
            return;
        }
        trace!(fd = self.channel.fd(), "Removing event bridge.");
        self.channel.disable_all();
        self.channel.remove();
    }

    pub fn is_removed(&self) -> bool {
        self.channel.is_removed()
    }

    pub fn is_reading(&self) -> bool {
        self.channel.is_reading()
    }

    pub fn is_writing(&self) -> bool {
        self.channel.is_writing()
    }
}

// Interest changes on a removed channel are ignored by the channel itself.
impl EventHooks for EventBridge {
    fn on_add_write(&self) {
        trace!(fd = self.channel.fd(), "add write");
        self.channel.enable_writing();
    }

    fn on_del_write(&self) {
        trace!(fd = self.channel.fd(), "del write");
        self.channel.disable_writing();
    }

    fn on_add_read(&self) {
        trace!(fd = self.channel.fd(), "add read");
        self.channel.enable_reading();
    }

    fn on_del_read(&self) {
        trace!(fd = self.channel.fd(), "del read");
        self.channel.disable_reading();
    }

    fn on_cleanup(&self) {
        trace!(fd = self.channel.fd(), "Engine cleanup.");
    }
}
