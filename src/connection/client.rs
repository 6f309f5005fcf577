// src/connection/client.rs

//! Defines `ClientConnection`, one pipelined connection to a RESP server driven by
//! an `EventLoop`.
//!
//! All connection state is read and mutated on the loop thread. `start`,
//! `send_command`, `execute` and `disconnect` may be called from any thread and
//! marshal their work onto it. Work queued on the loop and the callbacks stored in
//! the engine hold an `Arc` to the connection, so a started connection lives until
//! the engine's teardown releases them, even after its last outside handle is gone.
//! Reactor callbacks hold `Weak`s.

use super::bridge::EventBridge;
use super::endpoint::{Credential, Endpoint};
use super::pipeline::{CommandPipeline, PendingCommand, guarded};
use super::status::{ConnectStatus, StatusCell};
use crate::core::engine::{AsyncContext, ReplyCallback};
use crate::core::protocol::{RespFrame, RespValue, format_command};
use crate::core::ClientError;
use crate::reactor::EventLoop;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// A connection-scoped lifecycle handler.
pub type ConnectionHandler =
    Arc<dyn Fn(&Arc<ClientConnection>, Result<(), ClientError>) + Send + Sync>;

/// The connect and disconnect handlers of a connection. Fixed at construction.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    /// Called on the loop thread once the connection is established.
    pub on_connect: Option<ConnectionHandler>,
    /// Called on the loop thread exactly once when the connection ends, including when
    /// it never got established.
    pub on_disconnect: Option<ConnectionHandler>,
}

impl ConnectionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(
        mut self,
        handler: impl Fn(&Arc<ClientConnection>, Result<(), ClientError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnect(
        mut self,
        handler: impl Fn(&Arc<ClientConnection>, Result<(), ClientError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }
}

/// Session settings, sent ahead of any user command.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub credential: Credential,
    /// Logical database selected after connecting. `0` needs no `SELECT`.
    pub database: u32,
}

pub struct ClientConnection {
    endpoint: Endpoint,
    options: ConnectionOptions,
    event_loop: EventLoop,
    status: StatusCell,
    handlers: ConnectionHandlers,
    // Declared before `context` so the reactor subscription goes before the socket.
    bridge: Mutex<Option<Arc<EventBridge>>>,
    context: Mutex<Option<Arc<AsyncContext>>>,
    pipeline: Mutex<CommandPipeline>,
}

impl ClientConnection {
    pub fn new(
        event_loop: &EventLoop,
        endpoint: Endpoint,
        options: ConnectionOptions,
        handlers: ConnectionHandlers,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            options,
            event_loop: event_loop.clone(),
            status: StatusCell::new(),
            handlers,
            bridge: Mutex::new(None),
            context: Mutex::new(None),
            pipeline: Mutex::new(CommandPipeline::new()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectStatus {
        self.status.get()
    }

    /// Number of commands sent and not yet resolved.
    pub fn pending_commands(&self) -> usize {
        self.pipeline.lock().len()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Begins connecting. The endpoint is resolved on the calling thread, which may
    /// block on the system resolver; the rest of the setup always runs as a queued
    /// loop task, even when called on the loop thread. A failed resolve is reported
    /// like a failed connect. Calling it more than once has no effect.
    pub fn start(self: &Arc<Self>) {
        if !self.status.advance(ConnectStatus::Connecting) {
            warn!(
                "Ignoring start() for {} in state {}.",
                self.endpoint,
                self.status()
            );
            return;
        }
        let resolved = self.endpoint.resolve();
        let this = Arc::clone(self);
        self.event_loop.queue_in_loop(move || this.start_in_loop(resolved));
    }

    fn start_in_loop(self: &Arc<Self>, resolved: Result<SocketAddr, ClientError>) {
        self.event_loop.assert_in_loop_thread();
        if self.status() == ConnectStatus::Ended {
            // A disconnect overtook the setup.
            return;
        }

        let context = match resolved.and_then(AsyncContext::connect) {
            Ok(context) => context,
            Err(e) => {
                error!("Failed to connect to {}: {}", self.endpoint, e);
                self.connect_failed(e);
                return;
            }
        };

        let bridge = EventBridge::new(&self.event_loop, &context);
        context.set_hooks(bridge.clone());
        *self.bridge.lock() = Some(bridge);
        *self.context.lock() = Some(context.clone());

        // The engine drops both callbacks on teardown, which breaks the cycle.
        context.set_disconnect_callback({
            let conn = Arc::clone(self);
            move |status| conn.on_engine_disconnect(status)
        });
        // Installing the connect callback subscribes for writability.
        context.set_connect_callback({
            let conn = Arc::clone(self);
            move |status| conn.on_engine_connect(status)
        });
        self.bootstrap();
    }

    fn on_engine_connect(self: &Arc<Self>, status: Result<(), ClientError>) {
        if self.status() == ConnectStatus::Ended {
            return;
        }
        match status {
            Ok(()) => {
                self.status.advance(ConnectStatus::Connected);
                info!("Connected to {}.", self.endpoint);
                if let Some(handler) = &self.handlers.on_connect {
                    guarded("connect handler", || handler(self, Ok(())));
                }
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.endpoint, e);
                self.connect_failed(e);
            }
        }
    }

    fn connect_failed(self: &Arc<Self>, error: ClientError) {
        self.handle_disconnect();
        self.notify_disconnect(Err(error));
    }

    fn on_engine_disconnect(self: &Arc<Self>, status: Result<(), ClientError>) {
        if self.status() == ConnectStatus::Ended {
            return;
        }
        self.handle_disconnect();
        match &status {
            Ok(()) => info!("Disconnected from {}.", self.endpoint),
            Err(e) => warn!("Connection to {} lost: {}", self.endpoint, e),
        }
        self.notify_disconnect(status);
    }

    fn notify_disconnect(self: &Arc<Self>, status: Result<(), ClientError>) {
        if let Some(handler) = &self.handlers.on_disconnect {
            guarded("disconnect handler", || handler(self, status));
        }
    }

    /// Ends the connection: drops the reactor subscription and releases the bridge and
    /// the engine. Anything still in the pipeline is failed, oldest first.
    fn handle_disconnect(&self) {
        self.status.advance(ConnectStatus::Ended);
        let bridge = self.bridge.lock().take();
        if let Some(bridge) = bridge {
            bridge.remove();
        }
        self.context.lock().take();

        let leftovers: Vec<PendingCommand> = self.pipeline.lock().drain().collect();
        if !leftovers.is_empty() {
            debug!(
                "Failing {} unanswered command(s) on {}.",
                leftovers.len(),
                self.endpoint
            );
        }
        for pending in leftovers {
            pending.fail(ClientError::ConnectionClosed);
        }
    }

    /// Pipelines `AUTH` and `SELECT` as soon as the engine exists, so they precede any
    /// user command. The engine holds them until the handshake completes.
    fn bootstrap(self: &Arc<Self>) {
        if let Some(secret) = self.options.credential.secret() {
            let on_failure = self.bootstrap_failure("Authentication".to_string());
            self.send(
                format_command(["AUTH", secret]),
                |_| debug!("Authenticated."),
                on_failure,
            );
        }

        let database = self.options.database;
        if database != 0 {
            let index = database.to_string();
            let on_failure = self.bootstrap_failure(format!("Selecting database {database}"));
            self.send(
                format_command(["SELECT", index.as_str()]),
                move |_| debug!("Selected database {}.", database),
                on_failure,
            );
        }
    }

    /// A failed bootstrap step ends the connection. Losing the connection itself is
    /// reported through the disconnect handler instead.
    fn bootstrap_failure(
        self: &Arc<Self>,
        step: String,
    ) -> impl FnOnce(ClientError) + Send + 'static {
        let endpoint = self.endpoint.clone();
        let weak = Arc::downgrade(self);
        move |e| {
            if e.is_connection_error() {
                debug!("{} on {} abandoned: {}", step, endpoint, e);
                return;
            }
            error!("{} on {} failed: {}", step, endpoint, e);
            if let Some(conn) = weak.upgrade() {
                conn.request_disconnect();
            }
        }
    }

    /// Sends already formatted command bytes. Must run on the loop thread.
    ///
    /// Exactly one continuation runs per call. Before the connection was started the
    /// command fails with `NotConnected`; once it is disconnecting or ended, with
    /// `ConnectionClosed`.
    pub fn send(
        self: &Arc<Self>,
        command: Bytes,
        on_success: impl FnOnce(RespValue) + Send + 'static,
        on_failure: impl FnOnce(ClientError) + Send + 'static,
    ) {
        self.event_loop.assert_in_loop_thread();
        let pending = PendingCommand::new(on_success, on_failure);

        let context = self.context.lock().clone();
        let Some(context) = context else {
            let error = match self.status() {
                ConnectStatus::Ended => ClientError::ConnectionClosed,
                _ => ClientError::NotConnected,
            };
            pending.fail(error);
            return;
        };

        let conn = Arc::clone(self);
        let on_reply: ReplyCallback = Box::new(move |reply| conn.handle_result(reply));
        // The engine never answers from inside this call, so queueing the
        // continuation afterwards keeps the pipeline in send order.
        match context.send_formatted_command(command, on_reply) {
            Ok(()) => self.pipeline.lock().push_back(pending),
            Err(e) => pending.fail(e),
        }
    }

    /// Like `send`, callable from any thread. Runs inline on the loop thread and is
    /// queued otherwise, in which case the command may not be written on return.
    pub fn send_command(
        self: &Arc<Self>,
        command: Bytes,
        on_success: impl FnOnce(RespValue) + Send + 'static,
        on_failure: impl FnOnce(ClientError) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.event_loop
            .run_in_loop(move || this.send(command, on_success, on_failure));
    }

    /// Sends a command and awaits its reply. Error replies come back as
    /// `ClientError::Server`.
    pub async fn execute<I, A>(self: &Arc<Self>, args: I) -> Result<RespValue, ClientError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let (tx, rx) = oneshot::channel::<Result<RespValue, ClientError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_failure = {
            let tx = tx.clone();
            move |e: ClientError| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(e));
                }
            }
        };
        let on_success = move |value: RespValue| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(Ok(value));
            }
        };
        self.send_command(format_command(args), on_success, on_failure);
        // A dropped sender means the loop discarded the task.
        rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    fn handle_result(&self, reply: Option<RespFrame>) {
        let pending = self.pipeline.lock().pop_front();
        match pending {
            Some(pending) => pending.resolve(reply),
            None => warn!(
                "Reply from {} arrived with no pending command.",
                self.endpoint
            ),
        }
    }

    /// Asks the engine for an orderly disconnect. Must run on the loop thread.
    fn request_disconnect(self: &Arc<Self>) {
        if self.status() == ConnectStatus::Ended {
            return;
        }
        let context = self.context.lock().clone();
        match context {
            Some(context) => context.disconnect(),
            None => {
                // Never got as far as creating the engine.
                self.handle_disconnect();
                self.notify_disconnect(Ok(()));
            }
        }
    }

    /// Requests a disconnect and blocks until the loop has processed the request.
    /// Outstanding commands are still answered before the socket closes.
    ///
    /// Returns immediately if the connection already ended or the loop has stopped.
    ///
    /// # Panics
    ///
    /// Panics when called on the loop thread, where waiting would deadlock.
    pub fn disconnect(self: &Arc<Self>) {
        assert!(
            !self.event_loop.is_in_loop_thread(),
            "ClientConnection::disconnect() must not be called on the event loop thread"
        );
        if self.status() == ConnectStatus::Ended {
            return;
        }

        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            this.request_disconnect();
            let _ = tx.send(());
        });
        if rx.blocking_recv().is_err() {
            debug!(
                "Event loop '{}' stopped before the disconnect of {} ran.",
                self.event_loop.name(),
                self.endpoint
            );
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("pending_commands", &self.pending_commands())
            .finish_non_exhaustive()
    }
}
