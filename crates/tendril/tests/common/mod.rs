//! Shared helpers for the session integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;
use tendril::{handler_fn, Reply, Session, SessionBuilder};
use tokio::io::duplex;
use tokio::time::timeout;

/// Buffer size of the in-memory transport
pub const TRANSPORT_BUFFER: usize = 64 * 1024;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect a plain client to a session built from `server`
pub fn connect_pair(server: SessionBuilder) -> (Session, Session) {
    connect_with(Session::builder(), server)
}

/// Connect two sessions built from the given builders
pub fn connect_with(client: SessionBuilder, server: SessionBuilder) -> (Session, Session) {
    let (a, b) = duplex(TRANSPORT_BUFFER);
    let client = client.connect(a).expect("client session");
    let server = server.connect(b).expect("server session");
    (client, server)
}

/// Server that answers every request with the request itself
pub fn echo_server() -> SessionBuilder {
    Session::builder().with_handler(handler_fn(|payload, reply: Reply| async move {
        let _ = reply.send(payload);
    }))
}

/// Initialise test logging once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(TEST_TIMEOUT, future).await.expect("timed out")
}

/// Poll `condition` until it holds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
