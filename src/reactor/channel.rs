// src/reactor/channel.rs

//! Defines `Channel`, the per-descriptor subscription to an `EventLoop`.
//!
//! A channel does not own its descriptor. It tracks which readiness kinds the owner is
//! interested in and keeps the loop's `mio` registration in sync with that interest.
//! `mio` cannot register an empty interest set, so dropping the last interest
//! deregisters the descriptor and enabling one again re-registers it.

use super::EventLoop;
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{trace, warn};

/// A readiness callback. Invoked on the loop thread.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct ChannelState {
    reading: bool,
    writing: bool,
    registered: bool,
    removed: bool,
}

impl ChannelState {
    fn interest(&self) -> Option<Interest> {
        match (self.reading, self.writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// A subscription to readiness events for one descriptor.
pub struct Channel {
    event_loop: EventLoop,
    fd: RawFd,
    token: Token,
    state: Mutex<ChannelState>,
    read_callback: Mutex<Option<EventCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
}

impl Channel {
    /// Creates a channel for `fd` and makes it routable by `event_loop`. No interest
    /// is enabled yet.
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Arc<Self> {
        let token = event_loop.next_token();
        let channel = Arc::new(Self {
            event_loop: event_loop.clone(),
            fd,
            token,
            state: Mutex::new(ChannelState::default()),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
        });
        event_loop.attach(token, Arc::downgrade(&channel));
        channel
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.read_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.write_callback.lock() = Some(Arc::new(callback));
    }

    pub fn enable_reading(&self) {
        self.update(|state| state.reading = true);
    }

    pub fn disable_reading(&self) {
        self.update(|state| state.reading = false);
    }

    pub fn enable_writing(&self) {
        self.update(|state| state.writing = true);
    }

    pub fn disable_writing(&self) {
        self.update(|state| state.writing = false);
    }

    pub fn disable_all(&self) {
        self.update(|state| {
            state.reading = false;
            state.writing = false;
        });
    }

    pub fn is_reading(&self) -> bool {
        self.state.lock().reading
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Drops every interest and detaches the channel from its loop. Any further
    /// interest change is ignored.
    pub fn remove(&self) {
        self.update(|state| {
            state.reading = false;
            state.writing = false;
        });
        self.state.lock().removed = true;
        self.event_loop.detach(self.token);
    }

    fn update(&self, change: impl FnOnce(&mut ChannelState)) {
        self.event_loop.assert_in_loop_thread();
        let mut state = self.state.lock();
        if state.removed {
            trace!(fd = self.fd, "Ignoring interest change on removed channel.");
            return;
        }
        change(&mut state);
        if let Err(e) = self.sync_registration(&mut state) {
            warn!(fd = self.fd, "Failed to update reactor interest: {}", e);
        }
    }

    fn sync_registration(&self, state: &mut ChannelState) -> io::Result<()> {
        let registry = self.event_loop.registry();
        let mut source = SourceFd(&self.fd);
        match (state.interest(), state.registered) {
            (Some(interest), false) => {
                registry.register(&mut source, self.token, interest)?;
                state.registered = true;
            }
            (Some(interest), true) => registry.reregister(&mut source, self.token, interest)?,
            (None, true) => {
                // Mark first: a failed deregister means the descriptor is already gone.
                state.registered = false;
                registry.deregister(&mut source)?;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Dispatches one readiness event. Errors and hang-ups are delivered to whichever
    /// callback is subscribed so the owner observes them through its normal I/O path.
    pub(crate) fn handle_event(&self, event: &Event) {
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        if readable && self.wants(|state| state.reading) {
            let callback = self.read_callback.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
        }

        // The read callback may have changed interest or removed the channel.
        let writable = event.is_writable() || event.is_error();
        if writable && self.wants(|state| state.writing) {
            let callback = self.write_callback.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn wants(&self, interest: impl FnOnce(&ChannelState) -> bool) -> bool {
        let state = self.state.lock();
        !state.removed && interest(&state)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.registered {
            let _ = self
                .event_loop
                .registry()
                .deregister(&mut SourceFd(&self.fd));
        }
        self.event_loop.detach(self.token);
    }
}
