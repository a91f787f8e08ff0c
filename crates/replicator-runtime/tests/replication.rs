//! Integration test: fan-out writes and deletes, reads and status.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use replicator_core::{Existence, Method, Outcome, StorageBackend};
use replicator_runtime::{ClientTuning, ReplicationCoordinator};
use replicator_storage::LocalBackend;

use common::{backend_set, body, cluster, cluster_with, read_all, tuning};

#[tokio::test]
async fn test_write_succeeds_while_one_backend_is_down() {
    let c = cluster(&["one", "two", "three"]);
    c.backend("three").set_down(true);

    let result = c
        .node
        .coordinator
        .write("a.txt", body("hello", 2), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();

    assert!(result.is_successful());
    let succeeded: Vec<&str> = result.succeeded().iter().map(|b| b.as_str()).collect();
    assert_eq!(succeeded, vec!["one", "two"]);
    assert!(matches!(
        result.outcomes[2].outcome,
        Outcome::Failed { .. }
    ));

    // One record per success, one failure per failing backend
    let records = c.node.coordinator.log().records_for("a.txt").await.unwrap();
    let mut logged: Vec<&str> = records.iter().map(|r| r.backend.as_str()).collect();
    logged.sort();
    assert_eq!(logged, vec!["one", "two"]);

    let failures = c.node.coordinator.failures().all().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].backend.as_str(), "three");
    assert_eq!(failures[0].method, Method::Write);
    assert_eq!(failures[0].object_key, "a.txt");
}

#[tokio::test]
async fn test_write_fails_only_when_every_backend_fails() {
    let c = cluster(&["one", "two"]);
    c.backend("one").set_down(true);
    c.backend("two").set_down(true);

    let result = c
        .node
        .coordinator
        .write("a.txt", body("hello", 5), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();

    assert!(!result.is_successful());
    assert!(result.succeeded().is_empty());
    assert!(c.node.coordinator.log().all().await.unwrap().is_empty());
    assert_eq!(c.node.coordinator.failures().len().await.unwrap(), 2);
    assert!(c.node.coordinator.read("a.txt").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_read_round_trip() {
    let c = cluster(&["one", "two"]);
    let payload = Bytes::from((0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    c.node
        .coordinator
        .write(
            "bin/data",
            body(payload.clone(), 999),
            "application/octet-stream",
            Some(payload.len() as u64),
            Utc::now(),
        )
        .await
        .unwrap();

    let read = c.node.coordinator.read("bin/data").await.unwrap();
    assert_eq!(read.content_type(), Some("application/octet-stream"));
    assert_eq!(read_all(read.stream).await, payload);
}

#[tokio::test]
async fn test_read_uses_latest_backend_without_fallback() {
    let c = cluster(&["one", "two"]);
    c.backend("one").set_down(true);
    c.node
        .coordinator
        .write("a.txt", body("v1", 2), "text/plain", Some(2), Utc::now())
        .await
        .unwrap();
    c.backend("one").set_down(false);

    let read = c.node.coordinator.read("a.txt").await.unwrap();
    assert_eq!(read.backend.as_str(), "two");

    // The source of truth is down: no fallback even though nothing else has it
    c.backend("two").set_down(true);
    assert!(c.node.coordinator.read("a.txt").await.is_err());
}

#[tokio::test]
async fn test_delete_fans_out_and_reports_status() {
    let c = cluster(&["one", "two", "three"]);
    let coordinator = &c.node.coordinator;
    coordinator
        .write("a.txt", body("hello", 5), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();

    c.backend("two").set_down(true);
    let result = coordinator.delete("a.txt", Utc::now()).await.unwrap();
    assert!(result.is_successful());
    assert_eq!(result.failed().len(), 1);

    let statuses = coordinator.status_of("a.txt").await.unwrap();
    let summary: Vec<(&str, Existence)> = statuses
        .iter()
        .map(|s| (s.backend.as_str(), s.existence))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("one", Existence::Removed),
            ("three", Existence::Removed),
            ("two", Existence::Exists),
        ]
    );

    let failures = coordinator.failures().all().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].method, Method::Delete);
    assert!(coordinator.read("a.txt").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_status_all_groups_by_key() {
    let c = cluster(&["one", "two"]);
    for key in ["b.txt", "a.txt"] {
        c.node
            .coordinator
            .write(key, body("x", 1), "text/plain", Some(1), Utc::now())
            .await
            .unwrap();
    }
    let all = c.node.coordinator.status_all().await.unwrap();
    let keys: Vec<&str> = all.iter().map(|s| s.object_key.as_str()).collect();
    assert_eq!(keys, vec!["a.txt", "b.txt"]);
    assert!(all.iter().all(|s| s.backends.len() == 2));
}

#[tokio::test]
async fn test_disabled_replication_writes_primary_only() {
    let c = cluster(&["one", "two", "three"]);
    let settings = c.node.coordinator.disable().await.unwrap();
    assert!(!settings.enabled);

    let result = c
        .node
        .coordinator
        .write("a.txt", body("hello", 5), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].backend.as_str(), "one");
    assert!(c.backend("one").memory().exists("a.txt").await.unwrap());
    assert!(!c.backend("two").memory().exists("a.txt").await.unwrap());
    assert!(!c.backend("three").memory().exists("a.txt").await.unwrap());
}

#[tokio::test]
async fn test_slow_backend_times_out_and_is_queued() {
    let c = cluster_with(
        &["one", "two"],
        ClientTuning {
            request_timeout: Duration::from_millis(50),
            ..ClientTuning::default()
        },
    );
    c.backend("two").set_delay(Duration::from_secs(2));

    let result = c
        .node
        .coordinator
        .write("a.txt", body("hello", 5), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();

    assert!(result.is_successful());
    match &result.outcomes[1].outcome {
        Outcome::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(c.node.coordinator.failures().len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_long_key_with_filesystem_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let state = Arc::new(LocalBackend::new(dir.path()).await.unwrap());
    let (backends, set) = backend_set(&["one", "two"], tuning());
    let coordinator = ReplicationCoordinator::new(set, state);

    let key = "k".repeat(1024);
    let result = coordinator
        .write(&key, body("hello", 2), "text/plain", Some(5), Utc::now())
        .await
        .unwrap();
    assert!(result.failed().is_empty(), "{:?}", result.outcomes);
    assert!(backends[1].memory().exists(&key).await.unwrap());
    assert!(coordinator.failures().is_empty().await.unwrap());

    let statuses = coordinator.status_of(&key).await.unwrap();
    assert_eq!(statuses.len(), 2);
    let read = coordinator.read(&key).await.unwrap();
    assert_eq!(read_all(read.stream).await, Bytes::from("hello"));
}
