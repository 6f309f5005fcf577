// tests/integration/test_helpers.rs

//! Test helpers for integration tests: a scripted RESP server and a client probe
//! that records lifecycle events.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use spineldb_client::connection::{
    ClientConnection, ConnectStatus, ConnectionHandlers, ConnectionOptions, Endpoint,
};
use spineldb_client::core::{ClientError, RespValue};
use spineldb_client::core::protocol::{RespFrame, RespFrameCodec};
use spineldb_client::reactor::EventLoopThread;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Set up minimal tracing for tests (ignore error if already initialized).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// What the scripted server does with one request.
pub enum Reply {
    Frame(RespFrame),
    /// Waits before answering. Later requests on the same connection wait too.
    Delayed(Duration, RespFrame),
    /// Closes the connection without answering.
    Close,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Frame(RespFrame::SimpleString("OK".into()))
    }

    pub fn bulk(value: &str) -> Self {
        Reply::Frame(RespFrame::BulkString(Bytes::copy_from_slice(value.as_bytes())))
    }

    pub fn error(message: &str) -> Self {
        Reply::Frame(RespFrame::Error(message.to_string()))
    }
}

type Responder = Arc<dyn Fn(&[String]) -> Reply + Send + Sync>;

/// An in-process RESP server answering every request through a responder function.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(responder: impl Fn(&[String]) -> Reply + Send + Sync + 'static) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let log = requests.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let responder = responder.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, RespFrameCodec);
                    while let Some(Ok(frame)) = framed.next().await {
                        let args = command_args(frame);
                        log.lock().push(args.clone());
                        match responder(&args) {
                            Reply::Frame(reply) => {
                                if framed.send(reply).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Delayed(delay, reply) => {
                                tokio::time::sleep(delay).await;
                                if framed.send(reply).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Close => return,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            accept_task,
        }
    }

    /// A server that answers `PING` with `PONG` and echoes the first argument of any
    /// other command.
    pub async fn echo() -> Self {
        Self::start(|args| match args[0].as_str() {
            "PING" => Reply::Frame(RespFrame::SimpleString("PONG".into())),
            _ => Reply::bulk(args.get(1).map(String::as_str).unwrap_or("")),
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every request received so far, across connections.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn command_args(frame: RespFrame) -> Vec<String> {
    match frame {
        RespFrame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                RespFrame::BulkString(b) => String::from_utf8_lossy(&b).into_owned(),
                other => format!("{other:?}"),
            })
            .collect(),
        other => vec![format!("{other:?}")],
    }
}

/// An address nothing listens on.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A lifecycle notification observed through the connection handlers.
#[derive(Debug)]
pub enum Lifecycle {
    Connected,
    Disconnected(Result<(), ClientError>),
}

/// A connection on its own event loop, with its handlers wired to a shared log.
pub struct TestClient {
    pub conn: Arc<ClientConnection>,
    /// Ordered record of handler invocations and anything tests append.
    pub log: Arc<Mutex<Vec<String>>>,
    /// Status observed inside each handler invocation.
    pub statuses: Arc<Mutex<Vec<ConnectStatus>>>,
    events: mpsc::UnboundedReceiver<Lifecycle>,
    // Dropped last so the loop outlives the connection's final callbacks.
    _reactor: EventLoopThread,
}

impl TestClient {
    pub fn new(addr: SocketAddr, options: ConnectionOptions) -> Self {
        Self::for_endpoint(Endpoint::new(addr.ip().to_string(), addr.port()), options)
    }

    pub fn for_endpoint(endpoint: Endpoint, options: ConnectionOptions) -> Self {
        init_tracing();
        let reactor = EventLoopThread::spawn("test-reactor").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let (tx, events) = mpsc::unbounded_channel();

        let handlers = ConnectionHandlers::new()
            .on_connect({
                let (log, statuses, tx) = (log.clone(), statuses.clone(), tx.clone());
                move |conn, _| {
                    statuses.lock().push(conn.status());
                    log.lock().push("connected".to_string());
                    let _ = tx.send(Lifecycle::Connected);
                }
            })
            .on_disconnect({
                let (log, statuses) = (log.clone(), statuses.clone());
                move |conn, status| {
                    statuses.lock().push(conn.status());
                    let outcome = if status.is_ok() { "ok" } else { "error" };
                    log.lock().push(format!("disconnected:{outcome}"));
                    let _ = tx.send(Lifecycle::Disconnected(status));
                }
            });

        let conn = ClientConnection::new(
            reactor.event_loop(),
            endpoint,
            options,
            handlers,
        );
        Self {
            conn,
            log,
            statuses,
            events,
            _reactor: reactor,
        }
    }

    /// Starts a connection and waits until it is established.
    pub async fn connected(addr: SocketAddr) -> Self {
        Self::connected_with(addr, ConnectionOptions::default()).await
    }

    pub async fn connected_with(addr: SocketAddr, options: ConnectionOptions) -> Self {
        let mut client = Self::new(addr, options);
        client.conn.start();
        match client.next_event().await {
            Lifecycle::Connected => client,
            other => panic!("expected a connect, got {other:?}"),
        }
    }

    pub async fn next_event(&mut self) -> Lifecycle {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a lifecycle event")
            .expect("handlers dropped")
    }

    /// Asserts that no further lifecycle event arrives within a short grace period.
    pub async fn assert_no_more_events(&mut self) {
        if let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), self.events.recv()).await
        {
            panic!("unexpected lifecycle event: {event:?}");
        }
    }

    /// Calls the blocking `disconnect` off the runtime's worker threads.
    pub async fn disconnect(&self) {
        let conn = self.conn.clone();
        tokio::time::timeout(WAIT, tokio::task::spawn_blocking(move || conn.disconnect()))
            .await
            .expect("disconnect() did not return")
            .unwrap();
    }

    /// A continuation pair that appends `<tag>:ok <value>` or `<tag>:err <error>` to
    /// the shared log.
    pub fn recorder(
        &self,
        tag: &str,
    ) -> (
        impl FnOnce(RespValue) + Send + use<>,
        impl FnOnce(ClientError) + Send + use<>,
    ) {
        let (ok_log, err_log) = (self.log.clone(), self.log.clone());
        let (ok_tag, err_tag) = (tag.to_string(), tag.to_string());
        (
            move |value: RespValue| ok_log.lock().push(format!("{ok_tag}:ok {value}")),
            move |e: ClientError| err_log.lock().push(format!("{err_tag}:err {e}")),
        )
    }

    /// Polls the shared log until it holds `len` entries.
    pub async fn wait_for_log(&self, len: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let log = self.log.lock().clone();
            if log.len() >= len {
                return log;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {len} log entries, have {log:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
