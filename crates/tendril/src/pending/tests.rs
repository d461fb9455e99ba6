//! Unit tests for the pending request table

use super::*;
use serde_json::json;

#[tokio::test]
async fn test_register_and_complete() {
    let table = PendingTable::new();
    let rx = table.register("req-1").unwrap();
    assert!(table.contains("req-1"));
    assert_eq!(table.len(), 1);

    let tx = table.complete("req-1").unwrap();
    tx.send(Ok(Payload::new(json!("done")))).unwrap();
    assert_eq!(rx.await.unwrap().unwrap().data, json!("done"));

    assert!(table.complete("req-1").is_none());
    assert_eq!(table.len(), 0);
}

#[test]
fn test_duplicate_id_rejected() {
    let table = PendingTable::new();
    let _rx = table.register("req-1").unwrap();
    assert!(matches!(table.register("req-1"), Err(TendrilError::Session(_))));
}

#[tokio::test]
async fn test_close_fails_all_and_refuses_new() {
    let table = PendingTable::new();
    let first = table.register("req-1").unwrap();
    let second = table.register("req-2").unwrap();

    table.close(&TendrilError::ConnectionClosed("gone".into()));

    for rx in [first, second] {
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, TendrilError::ConnectionClosed(ref msg) if msg == "gone"));
    }
    assert!(matches!(table.register("req-3"), Err(TendrilError::ConnectionClosed(_))));
    assert!(table.closed_error().is_some());
    assert_eq!(table.len(), 0);
}

#[test]
fn test_close_keeps_first_error() {
    let table = PendingTable::new();
    table.close(&TendrilError::Transport("first".into()));
    table.close(&TendrilError::ConnectionClosed("second".into()));
    assert!(matches!(table.closed_error(), Some(TendrilError::Transport(_))));
}

#[test]
fn test_guard_removes_entry() {
    let table = PendingTable::new();
    let _rx = table.register("req-9").unwrap();
    {
        let _guard = PendingGuard::new(&table, "req-9");
    }
    assert!(!table.contains("req-9"));
}
