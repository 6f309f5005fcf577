// src/core/engine/context.rs

//! Implements `AsyncContext`, the non-blocking RESP protocol engine.
//!
//! The engine owns the socket, an outbound buffer of formatted commands, an inbound
//! parse buffer, and a FIFO of reply callbacks (one per command written). It never
//! waits for readiness itself: whoever drives it calls `handle_read`/`handle_write`
//! when the socket is ready, and the engine reports what it needs next through its
//! `EventHooks`.
//!
//! Lifecycle notifications:
//! - the connect callback fires once the non-blocking connect resolves, either way;
//! - the disconnect callback fires once on teardown, unless the connect callback
//!   already reported a failed connect. Every context therefore ends with exactly one
//!   terminal notification.

use super::hooks::EventHooks;
use crate::core::ClientError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

const READ_CHUNK_SIZE: usize = 16 * 1024;

bitflags! {
    /// State flags of an `AsyncContext`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u8 {
        /// The transport handshake completed.
        const CONNECTED     = 1 << 0;
        /// A disconnect was requested; no new commands are accepted.
        const DISCONNECTING = 1 << 1;
        /// Teardown has started (or finished).
        const FREEING       = 1 << 2;
    }
}

/// Receives the reply to one command, or `None` if the context was torn down first.
pub type ReplyCallback = Box<dyn FnOnce(Option<RespFrame>) + Send>;
/// Receives the outcome of a connect or the status of a disconnect.
pub type StatusCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

struct ContextState {
    stream: Option<TcpStream>,
    flags: ContextFlags,
    write_buf: BytesMut,
    read_buf: BytesMut,
    replies: VecDeque<ReplyCallback>,
    err: Option<ClientError>,
}

/// A non-blocking connection to a RESP server.
pub struct AsyncContext {
    addr: SocketAddr,
    fd: RawFd,
    hooks: Mutex<Option<Arc<dyn EventHooks>>>,
    state: Mutex<ContextState>,
    on_connect: Mutex<Option<StatusCallback>>,
    on_disconnect: Mutex<Option<StatusCallback>>,
}

impl AsyncContext {
    /// Starts a non-blocking connect to `addr`. The connect has usually not completed
    /// when this returns; its outcome is reported through the connect callback.
    pub fn connect(addr: SocketAddr) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect(addr)?;
        let fd = stream.as_raw_fd();
        debug!("Connecting to {} on fd {}.", addr, fd);
        Ok(Arc::new(Self {
            addr,
            fd,
            hooks: Mutex::new(None),
            state: Mutex::new(ContextState {
                stream: Some(stream),
                flags: ContextFlags::empty(),
                write_buf: BytesMut::with_capacity(4096),
                read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
                replies: VecDeque::new(),
                err: None,
            }),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The socket descriptor, for registering with a reactor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn flags(&self) -> ContextFlags {
        self.state.lock().flags
    }

    pub fn is_connected(&self) -> bool {
        self.flags().contains(ContextFlags::CONNECTED)
    }

    /// True once a disconnect was requested or teardown has begun.
    pub fn is_disconnecting(&self) -> bool {
        self.flags()
            .intersects(ContextFlags::DISCONNECTING | ContextFlags::FREEING)
    }

    /// The error that caused teardown, if any.
    pub fn error(&self) -> Option<ClientError> {
        self.state.lock().err.clone()
    }

    /// Number of commands written (or buffered) that have not been answered yet.
    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    pub fn set_hooks(&self, hooks: Arc<dyn EventHooks>) {
        *self.hooks.lock() = Some(hooks);
    }

    /// Installs the connect callback. Installing the first one asks for write interest:
    /// a non-blocking connect resolves when the socket becomes writable.
    pub fn set_connect_callback(
        &self,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        let first = self.on_connect.lock().replace(Box::new(callback)).is_none();
        if first && !self.is_connected() {
            self.hook(|hooks| hooks.on_add_write());
        }
    }

    pub fn set_disconnect_callback(
        &self,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        *self.on_disconnect.lock() = Some(Box::new(callback));
    }

    /// Queues already formatted command bytes and the callback for their reply.
    ///
    /// Refused with `ConnectionClosed` once a disconnect was requested; the callback is
    /// dropped in that case. The reply is never delivered from within this call.
    pub fn send_formatted_command(
        &self,
        command: Bytes,
        callback: ReplyCallback,
    ) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            if state
                .flags
                .intersects(ContextFlags::DISCONNECTING | ContextFlags::FREEING)
            {
                return Err(ClientError::ConnectionClosed);
            }
            state.write_buf.extend_from_slice(&command);
            state.replies.push_back(callback);
        }
        self.hook(|hooks| hooks.on_add_write());
        Ok(())
    }

    /// Requests an orderly disconnect. New commands are refused from now on; the
    /// socket is closed once every outstanding reply has been delivered.
    pub fn disconnect(&self) {
        let outstanding = {
            let mut state = self.state.lock();
            if state.flags.contains(ContextFlags::FREEING) {
                return;
            }
            state.flags.insert(ContextFlags::DISCONNECTING);
            state.replies.len()
        };
        debug!(
            "Disconnect requested for {} with {} outstanding repl{}.",
            self.addr,
            outstanding,
            if outstanding == 1 { "y" } else { "ies" }
        );
        if outstanding == 0 {
            self.teardown(Ok(()));
        }
    }

    /// Write pump. Completes a pending connect first, then flushes buffered commands.
    pub fn handle_write(&self) {
        if !self.handle_connect() {
            return;
        }
        let flushed = {
            let mut state = self.state.lock();
            flush(&mut state)
        };
        match flushed {
            Ok(done) => {
                if done {
                    self.hook(|hooks| hooks.on_del_write());
                } else {
                    self.hook(|hooks| hooks.on_add_write());
                }
                // Replies can only follow writes; keep reading.
                self.hook(|hooks| hooks.on_add_read());
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Read pump. Drains the socket, then delivers every complete reply.
    pub fn handle_read(&self) {
        if !self.handle_connect() {
            return;
        }
        let filled = {
            let mut state = self.state.lock();
            fill(&mut state)
        };
        match filled {
            Ok(false) => {
                self.hook(|hooks| hooks.on_add_read());
                self.process_replies();
            }
            Ok(true) => {
                // Deliver whatever arrived before the FIN, then tear down.
                self.process_replies();
                self.fail(ClientError::ConnectionClosed);
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Resolves an in-progress connect. Returns true when the transport is connected.
    fn handle_connect(&self) -> bool {
        let outcome = {
            let mut state = self.state.lock();
            if state.flags.contains(ContextFlags::FREEING) {
                return false;
            }
            if state.flags.contains(ContextFlags::CONNECTED) {
                return true;
            }
            let outcome = match state.stream.as_ref() {
                None => return false,
                Some(stream) => match stream.take_error() {
                    Ok(Some(e)) | Err(e) => Err(ClientError::from(e)),
                    Ok(None) => match stream.peer_addr() {
                        Ok(_) => Ok(()),
                        // Spurious wakeup: the handshake is still in flight.
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => return false,
                        Err(e) => Err(ClientError::from(e)),
                    },
                },
            };
            match &outcome {
                Ok(()) => {
                    state.flags.insert(ContextFlags::CONNECTED);
                    if let Some(stream) = state.stream.as_ref() {
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!("Could not set TCP_NODELAY on fd {}: {}", self.fd, e);
                        }
                    }
                }
                Err(e) => state.err = Some(e.clone()),
            }
            outcome
        };

        let callback = self.on_connect.lock().take();
        match outcome {
            Ok(()) => {
                debug!("Connected to {}.", self.addr);
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
                true
            }
            Err(e) => {
                // The connect callback is the terminal notification for this context.
                self.on_disconnect.lock().take();
                self.finish(Err(e), callback);
                false
            }
        }
    }

    fn process_replies(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.flags.contains(ContextFlags::FREEING) {
                    return;
                }
                let decoded = RespFrameCodec.decode(&mut state.read_buf);
                match decoded {
                    Ok(Some(frame)) => Ok(Some((frame, state.replies.pop_front()))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            };
            match next {
                Ok(Some((frame, Some(callback)))) => callback(Some(frame)),
                Ok(Some((frame, None))) => {
                    warn!("Dropping unsolicited reply from {}: {:?}", self.addr, frame);
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        let drained = {
            let state = self.state.lock();
            state.flags.contains(ContextFlags::DISCONNECTING)
                && !state.flags.contains(ContextFlags::FREEING)
                && state.replies.is_empty()
        };
        if drained {
            self.teardown(Ok(()));
        }
    }

    fn fail(&self, error: ClientError) {
        debug!("Connection to {} failed: {}", self.addr, error);
        self.teardown(Err(error));
    }

    /// Fails outstanding replies, runs the cleanup hook and the disconnect callback,
    /// and finally closes the socket. Runs at most once.
    fn teardown(&self, status: Result<(), ClientError>) {
        let on_disconnect = self.on_disconnect.lock().take();
        self.finish(status, on_disconnect);
    }

    fn finish(&self, status: Result<(), ClientError>, terminal: Option<StatusCallback>) {
        let (replies, stream) = {
            let mut state = self.state.lock();
            if state.flags.contains(ContextFlags::FREEING) {
                return;
            }
            state.flags.insert(ContextFlags::FREEING);
            if let Err(e) = &status {
                state.err.get_or_insert_with(|| e.clone());
            }
            (std::mem::take(&mut state.replies), state.stream.take())
        };

        if !replies.is_empty() {
            debug!(
                "Failing {} outstanding repl{} on {}.",
                replies.len(),
                if replies.len() == 1 { "y" } else { "ies" },
                self.addr
            );
        }
        for callback in replies {
            callback(None);
        }

        self.hook(|hooks| hooks.on_cleanup());
        if let Some(callback) = terminal {
            callback(status);
        }

        // The descriptor is closed only after the reactor subscription is gone.
        drop(stream);
        self.on_connect.lock().take();
        self.hooks.lock().take();
    }

    fn hook(&self, call: impl FnOnce(&dyn EventHooks)) {
        let hooks = self.hooks.lock().clone();
        if let Some(hooks) = hooks {
            call(hooks.as_ref());
        }
    }
}

/// Writes buffered output until it is drained (`Ok(true)`) or the socket is full.
fn flush(state: &mut ContextState) -> io::Result<bool> {
    let ContextState {
        stream, write_buf, ..
    } = state;
    let Some(stream) = stream.as_mut() else {
        return Ok(true);
    };
    while !write_buf.is_empty() {
        match stream.write(&write_buf[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => write_buf.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Reads until the socket would block. Returns `Ok(true)` when the peer closed.
fn fill(state: &mut ContextState) -> io::Result<bool> {
    let ContextState {
        stream, read_buf, ..
    } = state;
    let Some(stream) = stream.as_mut() else {
        return Ok(true);
    };
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => read_buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
