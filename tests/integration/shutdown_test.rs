// tests/integration/shutdown_test.rs

//! Tests for the blocking, cross-thread `disconnect`.

use super::test_helpers::{Lifecycle, MockServer, Reply, TestClient, WAIT, init_tracing};
use parking_lot::Mutex;
use spineldb_client::connection::{
    ClientConnection, ConnectStatus, ConnectionHandlers, ConnectionOptions, Endpoint,
};
use spineldb_client::core::ClientError;
use spineldb_client::core::protocol::{RespFrame, format_command};
use spineldb_client::reactor::EventLoopThread;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_is_idempotent() {
    let server = MockServer::echo().await;
    let mut client = TestClient::connected(server.addr()).await;

    client.disconnect().await;
    client.disconnect().await;
    assert!(matches!(
        client.next_event().await,
        Lifecycle::Disconnected(Ok(()))
    ));
    client.disconnect().await;
    client.assert_no_more_events().await;

    assert_eq!(client.conn.status(), ConnectStatus::Ended);
    assert_eq!(*client.log.lock(), vec!["connected", "disconnected:ok"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_lets_outstanding_replies_arrive() {
    let server = MockServer::start(|args| match args[0].as_str() {
        "SLOW" => Reply::Delayed(
            Duration::from_millis(200),
            RespFrame::SimpleString("DONE".into()),
        ),
        _ => Reply::ok(),
    })
    .await;
    let mut client = TestClient::connected(server.addr()).await;

    let (on_success, on_failure) = client.recorder("slow");
    client
        .conn
        .send_command(format_command(["SLOW"]), on_success, on_failure);
    client.disconnect().await;

    // Refused once the disconnect was requested.
    assert!(matches!(
        client.conn.execute(["PING"]).await,
        Err(ClientError::ConnectionClosed)
    ));

    assert!(matches!(
        client.next_event().await,
        Lifecycle::Disconnected(Ok(()))
    ));
    assert_eq!(
        *client.log.lock(),
        vec!["connected", "slow:ok DONE", "disconnected:ok"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_returns_once_the_loop_has_stopped() {
    init_tracing();
    let server = MockServer::echo().await;
    let reactor = EventLoopThread::spawn("stopping-reactor").unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handlers = ConnectionHandlers::new().on_connect(move |_, status| {
        let _ = tx.send(status);
    });
    let conn = ClientConnection::new(
        reactor.event_loop(),
        Endpoint::new("127.0.0.1", server.addr().port()),
        ConnectionOptions::default(),
        handlers,
    );
    conn.start();
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    drop(reactor);

    let c = conn.clone();
    tokio::time::timeout(WAIT, tokio::task::spawn_blocking(move || c.disconnect()))
        .await
        .expect("disconnect() blocked on a stopped loop")
        .unwrap();
    assert_eq!(conn.status(), ConnectStatus::Connected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropping_the_last_handle_still_resolves_every_command() {
    init_tracing();
    let server = MockServer::start(|args| match args[0].as_str() {
        "SLOW" => Reply::Delayed(
            Duration::from_millis(300),
            RespFrame::SimpleString("DONE".into()),
        ),
        "DIE" => Reply::Close,
        _ => Reply::ok(),
    })
    .await;
    let reactor = EventLoopThread::spawn("orphaned-reactor").unwrap();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handlers = ConnectionHandlers::new()
        .on_connect({
            let (log, tx) = (log.clone(), tx.clone());
            move |_, _| {
                log.lock().push("connected".to_string());
                let _ = tx.send(Lifecycle::Connected);
            }
        })
        .on_disconnect({
            let log = log.clone();
            move |_, status| {
                let outcome = if status.is_ok() { "ok" } else { "error" };
                log.lock().push(format!("disconnected:{outcome}"));
                let _ = tx.send(Lifecycle::Disconnected(status));
            }
        });
    let conn = ClientConnection::new(
        reactor.event_loop(),
        Endpoint::new("127.0.0.1", server.addr().port()),
        ConnectionOptions::default(),
        handlers,
    );
    conn.start();
    assert!(matches!(
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap(),
        Some(Lifecycle::Connected)
    ));

    for tag in ["slow", "die"] {
        let (ok_log, err_log) = (log.clone(), log.clone());
        conn.send_command(
            format_command([tag.to_uppercase()]),
            move |value| ok_log.lock().push(format!("{tag}:ok {value}")),
            move |e| err_log.lock().push(format!("{tag}:err {e}")),
        );
    }
    let deadline = tokio::time::Instant::now() + WAIT;
    while conn.pending_commands() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "commands never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(conn);

    match tokio::time::timeout(WAIT, rx.recv()).await.unwrap() {
        Some(Lifecycle::Disconnected(Err(_))) => {}
        other => panic!("expected a failed disconnect, got {other:?}"),
    }
    assert_eq!(
        *log.lock(),
        vec![
            "connected",
            "slow:ok DONE",
            "die:err Connection closed",
            "disconnected:error"
        ]
    );
}
