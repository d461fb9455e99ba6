//! Tendril Echo
//!
//! Serves an echo handler over TCP, or runs a demo client against one.
//!
//! ```text
//! tendril-echo serve --listen 127.0.0.1:7070
//! tendril-echo demo --connect 127.0.0.1:7070
//! ```
//!
//! The address defaults to `TENDRIL_ADDR`, then `127.0.0.1:7070`.

use anyhow::{bail, Context, Result};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tendril::{EmbeddedStream, Payload, Session, SessionEvent};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

mod echo;

use echo::EchoHandler;

const DEFAULT_ADDR: &str = "127.0.0.1:7070";

/// Pause after a failed accept so a persistent error (out of descriptors)
/// does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Command {
    Serve { listen: String },
    Demo { connect: String },
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let default_addr = std::env::var("TENDRIL_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let mode = args.next().unwrap_or_else(|| "serve".to_string());
    let mut addr = default_addr;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--connect" => {
                addr = args.next().with_context(|| format!("{} needs an address", arg))?;
            }
            other => bail!("unknown argument: {}", other),
        }
    }

    match mode.as_str() {
        "serve" => Ok(Command::Serve { listen: addr }),
        "demo" => Ok(Command::Demo { connect: addr }),
        other => bail!("unknown mode: {} (expected serve or demo)", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match parse_args(std::env::args().skip(1))? {
        Command::Serve { listen } => serve(&listen).await,
        Command::Demo { connect } => demo(&connect).await,
    }
}

async fn serve(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Echo server listening on {}", addr);
    accept_loop(listener, Arc::new(EchoHandler::new())).await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, handler: Arc<EchoHandler>) {
    loop {
        let Some((socket, peer)) = admit(listener.accept().await) else {
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            continue;
        };
        if let Err(e) = start_session(socket, peer, Arc::clone(&handler)) {
            warn!(%peer, error = %e, "failed to start session");
        }
    }
}

/// A failed accept affects one connection, never the server
fn admit(accepted: io::Result<(TcpStream, SocketAddr)>) -> Option<(TcpStream, SocketAddr)> {
    match accepted {
        Ok(connection) => Some(connection),
        Err(e) => {
            warn!(error = %e, "accept failed");
            None
        }
    }
}

fn start_session(socket: TcpStream, peer: SocketAddr, handler: Arc<EchoHandler>) -> Result<()> {
    socket.set_nodelay(true)?;
    let session = Session::builder()
        .with_handler(Arc::clone(&handler))
        .connect(socket)?;
    info!(%peer, session = %session.id(), "peer connected");

    tokio::spawn(async move {
        let mut events = session.events();
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Error(e) => warn!(%peer, error = %e, "session error"),
                SessionEvent::ResponseError { request_id, error } => {
                    warn!(%peer, %request_id, error = %error, "response stream failed")
                }
                SessionEvent::Closed => break,
            }
        }
        info!(%peer, served = handler.served(), "peer disconnected");
    });
    Ok(())
}

async fn demo(addr: &str) -> Result<()> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    socket.set_nodelay(true)?;
    let session = Session::new(socket)?;
    info!("Connected to {}", addr);

    let numbers = stream::iter((1..=5).map(|n| json!({"n": n, "square": n * n})));
    let payload = Payload::new(json!({"greeting": "hello from tendril"}))
        .with_stream("numbers", EmbeddedStream::item_readable(numbers));

    let mut response = session.request(payload).await?;
    println!("echoed data: {}", response.data);

    match response.take_stream("numbers").and_then(EmbeddedStream::into_items) {
        Some(mut items) => {
            while let Some(item) = items.next().await {
                let item: Value = item?;
                println!("echoed item: {}", item);
            }
        }
        None => error!("echo came back without the numbers stream"),
    }

    session.fire(Payload::new(json!("bye")))?;
    session.close();
    session.closed().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_args() {
        match parse_args(args(&["serve", "--listen", "0.0.0.0:9000"])).unwrap() {
            Command::Serve { listen } => assert_eq!(listen, "0.0.0.0:9000"),
            Command::Demo { .. } => panic!("expected serve"),
        }
        match parse_args(args(&["demo", "--connect", "10.0.0.1:1"])).unwrap() {
            Command::Demo { connect } => assert_eq!(connect, "10.0.0.1:1"),
            Command::Serve { .. } => panic!("expected demo"),
        }
        assert!(parse_args(args(&["bogus"])).is_err());
        assert!(parse_args(args(&["serve", "--listen"])).is_err());
        assert!(parse_args(args(&["serve", "--verbose"])).is_err());
    }

    #[test]
    fn test_failed_accept_is_skipped() {
        let refused = io::Error::new(io::ErrorKind::ConnectionAborted, "peer gave up during handshake");
        assert!(admit(Err(refused)).is_none());
    }

    #[tokio::test]
    async fn test_server_survives_broken_peer() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(accept_loop(listener, Arc::new(EchoHandler::new())));

        let mut garbage = TcpStream::connect(addr).await?;
        garbage.write_all(&[0xff; 64]).await?;
        drop(garbage);

        let session = Session::new(TcpStream::connect(addr).await?)?;
        let response = tokio::time::timeout(Duration::from_secs(5), session.request(Payload::new(json!("still here"))))
            .await??;
        assert_eq!(response.data, json!("still here"));
        assert!(!server.is_finished());
        server.abort();
        Ok(())
    }
}
