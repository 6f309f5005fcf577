// src/main.rs

//! The command-line client: connects, runs one command, and prints the reply.

use anyhow::{Context, Result, anyhow};
use spineldb_client::config::Config;
use spineldb_client::connection::{ClientConnection, ConnectionHandlers};
use spineldb_client::core::ClientError;
use spineldb_client::reactor::EventLoopThread;
use std::env;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

const USAGE: &str =
    "Usage: spineldb-client [--config <path>] [--host <host>] [--port <port>] <command> [args...]";

#[tokio::main]
async fn main() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().skip(1).collect();

    let (config, command) = match parse_args(&args) {
        Ok(Invocation::Version) => {
            println!("spineldb-client version {VERSION}");
            return Ok(());
        }
        Ok(Invocation::Run(config, command)) => (config, command),
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    // Get the log level from the env var or the config. Logs go to stderr so that
    // stdout carries only the reply.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(config, command).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// What the command line asks for.
#[derive(Debug)]
enum Invocation {
    Version,
    Run(Config, Vec<String>),
}

/// Splits the arguments into the configuration and the command to run. Options are
/// only recognised before the command; everything from the command on is sent as is.
fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config_path = None;
    let mut host = None;
    let mut port = None;

    let mut iter = args.iter();
    let mut command = Vec::new();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" => return Ok(Invocation::Version),
            "--config" => {
                config_path = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("--config flag requires a value"))?,
                );
            }
            "--host" => {
                host = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("--host flag requires a value"))?
                        .clone(),
                );
            }
            "--port" => {
                let port_str = iter
                    .next()
                    .ok_or_else(|| anyhow!("--port flag requires a value"))?;
                port = Some(
                    port_str
                        .parse::<u16>()
                        .map_err(|_| anyhow!("Invalid port number: {port_str}"))?,
                );
            }
            _ => {
                command.push(arg.clone());
                command.extend(iter.by_ref().cloned());
            }
        }
    }

    // The config file is loaded first so that --host/--port override it.
    let mut config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    config.validate()?;
    if command.is_empty() {
        return Err(anyhow!("no command given"));
    }
    Ok(Invocation::Run(config, command))
}

/// Connects, runs the command and disconnects. Returns false when the server
/// answered with an error.
async fn run(config: Config, command: Vec<String>) -> Result<bool> {
    let reactor = EventLoopThread::spawn(&config.reactor_name)
        .context("Failed to start the event loop thread")?;

    // The first lifecycle event decides whether the command can run.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Result<(), ClientError>>();
    let disconnect_tx = events_tx.clone();
    let handlers = ConnectionHandlers::new()
        .on_connect(move |_, status| {
            let _ = events_tx.send(status);
        })
        .on_disconnect(move |_, status| {
            let _ = disconnect_tx.send(status.and(Err(ClientError::ConnectionClosed)));
        });

    let conn = ClientConnection::new(
        reactor.event_loop(),
        config.endpoint(),
        config.connection_options(),
        handlers,
    );
    info!("Connecting to {}...", conn.endpoint());
    conn.start();

    match events_rx.recv().await {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Could not connect to {}", conn.endpoint())));
        }
        None => {
            return Err(anyhow!(
                "event loop stopped before the connection was established"
            ));
        }
    }

    let succeeded = match conn.execute(&command).await {
        Ok(value) => {
            println!("{value}");
            true
        }
        Err(ClientError::Server(message)) => {
            println!("(error) {message}");
            false
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Command failed")),
    };

    let disconnecting = conn.clone();
    tokio::task::spawn_blocking(move || disconnecting.disconnect())
        .await
        .context("Disconnect task failed")?;
    debug!("Connection status after disconnect: {}", conn.status());
    Ok(succeeded)
}
