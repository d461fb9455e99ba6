//! Unit tests for the reply context pool and reply handle

use super::*;
use crate::{handler_fn, Session, SessionBuilder};
use serde_json::json;
use std::collections::HashSet;
use tendril_proto::{Multiplexer, MuxConfig};
use tokio::io::duplex;
use tokio::sync::Semaphore;

fn permits(n: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(n))
}

#[tokio::test]
async fn test_pool_checkout_release_cycle() {
    let (a, _b) = duplex(1024);
    let (mux, _incoming) = Multiplexer::new(a, MuxConfig::default());
    let destination = mux.open_channel("rpc").unwrap().sender();
    let slots = permits(4);
    let pool = ReplyPool::new(4);
    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.available(), 4);

    let context = pool.checkout().unwrap();
    assert!(pool.bind(
        context,
        "req-1",
        destination.clone(),
        Arc::clone(&slots).try_acquire_owned().unwrap()
    ));
    assert_eq!(pool.available(), 3);
    assert_eq!(slots.available_permits(), 3);

    let (id, bound) = pool.binding(context).unwrap();
    assert_eq!(id, "req-1");
    assert_eq!(bound.name(), "rpc");

    let completion = pool.release(context);
    assert!(completion.is_some());
    drop(completion);
    assert_eq!(slots.available_permits(), 4);
    assert_eq!(pool.available(), 4);
    assert!(pool.binding(context).is_none());
}

#[tokio::test]
async fn test_stale_context_is_ignored() {
    let (a, _b) = duplex(1024);
    let (mux, _incoming) = Multiplexer::new(a, MuxConfig::default());
    let destination = mux.open_channel("rpc").unwrap().sender();
    let slots = permits(1);
    let pool = ReplyPool::new(1);

    let stale = pool.checkout().unwrap();
    pool.bind(stale, "req-1", destination.clone(), Arc::clone(&slots).try_acquire_owned().unwrap());
    pool.release(stale);

    let fresh = pool.checkout().unwrap();
    assert_ne!(stale, fresh);
    assert!(!pool.bind(stale, "req-2", destination.clone(), Arc::clone(&slots).try_acquire_owned().unwrap()));
    assert!(pool.bind(fresh, "req-3", destination, Arc::clone(&slots).try_acquire_owned().unwrap()));

    assert!(pool.release(stale).is_none());
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.binding(fresh).unwrap().0, "req-3");
}

#[test]
fn test_checked_out_contexts_are_distinct() {
    let pool = ReplyPool::new(8);
    let contexts: Vec<_> = (0..8).map(|_| pool.checkout().unwrap()).collect();
    assert!(pool.checkout().is_none());

    let indices: HashSet<usize> = contexts.iter().map(|c| c.index).collect();
    assert_eq!(indices.len(), 8);

    for context in contexts {
        pool.release(context);
    }
    assert_eq!(pool.available(), 8);
}

fn pair(server: SessionBuilder) -> (Session, Session) {
    let (a, b) = duplex(64 * 1024);
    (Session::new(a).unwrap(), server.connect(b).unwrap())
}

#[tokio::test]
async fn test_dropped_reply_sends_error() {
    let (client, server) = pair(Session::builder().with_handler(handler_fn(|_payload, reply: Reply| async move {
        drop(reply);
    })));

    let err = client.request(Payload::new(json!("anyone?"))).await.unwrap_err();
    assert!(matches!(err, TendrilError::Remote(ref msg) if msg == DROPPED_REPLY));
    assert_eq!(server.reply_contexts_available(), server.reply_contexts_capacity());
}

#[tokio::test]
async fn test_reply_variants() {
    let (client, _server) = pair(Session::builder().with_handler(handler_fn(|payload, reply: Reply| async move {
        assert!(reply.request_id().unwrap().starts_with("req-"));
        let _ = match payload.data["mode"].as_str() {
            Some("ok") => reply.ok(&json!({"typed": true})),
            Some("empty") => reply.empty(),
            _ => reply.error("unknown mode"),
        };
    })));

    let ok = client.request(Payload::new(json!({"mode": "ok"}))).await.unwrap();
    assert_eq!(ok.data, json!({"typed": true}));

    let empty = client.request(Payload::new(json!({"mode": "empty"}))).await.unwrap();
    assert_eq!(empty.data, serde_json::Value::Null);
    assert!(!empty.has_streams());

    let err = client.request(Payload::new(json!({"mode": "?"}))).await.unwrap_err();
    assert_eq!(err.to_string(), "unknown mode");
}
