use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing_test::traced_test;

use super::*;
use crate::Backend;
use crate::EventKind;
use crate::LockConfig;
use crate::LockRequest;
use crate::NativeWatch;

async fn client() -> (Arc<MemCasKeyspace>, CasClient) {
    let keyspace = Arc::new(MemCasKeyspace::default());
    let lock = LockConfig {
        hold_ttl_secs: 60,
        refresh_jitter: false,
        ..Default::default()
    };
    let client = CasClient::connect(keyspace.clone(), "volplugin", lock).await.unwrap();
    (keyspace, client)
}

fn lock(owner: &str) -> LockRequest {
    let payload = format!(r#"{{"volume":"policy/vol","owner":"{owner}","reason":"Create"}}"#);
    LockRequest {
        path: "users/volume/policy/vol".to_string(),
        payload: Bytes::from(payload.clone()),
        display: payload,
    }
}

#[tokio::test]
async fn test_connect_creates_prefix_once() {
    let (keyspace, client) = client().await;
    let root = keyspace.get("/volplugin", GetOptions::default()).await.unwrap();
    assert!(root.node.dir);

    // A second client on the same root tolerates the existing directory
    CasClient::connect(keyspace.clone(), "/volplugin/", LockConfig::default())
        .await
        .unwrap();
    assert_eq!(client.prefix(), "/volplugin");
}

#[tokio::test]
async fn test_put_get_list_delete() {
    let (_, client) = client().await;
    client.put("policies/a", Bytes::from_static(b"{}")).await.unwrap();
    client.put("volumes/a/v1", Bytes::from_static(b"1")).await.unwrap();
    client.put("volumes/a/v2", Bytes::from_static(b"2")).await.unwrap();

    let entry = client.get("policies/a").await.unwrap();
    assert_eq!(entry.key, "policies/a");
    assert_eq!(entry.value, Bytes::from_static(b"{}"));

    let keys: Vec<_> = client
        .list("volumes")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(keys, vec!["volumes/a/v1", "volumes/a/v2"]);
    assert!(client.list("runtime-policies").await.unwrap().is_empty());

    client.delete("policies/a").await.unwrap();
    assert!(client.get("policies/a").await.unwrap_err().is_not_exists());
    assert!(client.delete("policies/a").await.unwrap_err().is_not_exists());
}

#[tokio::test]
async fn test_tree_covers_prefix() {
    let (_, client) = client().await;
    client.put("policies/a", Bytes::from_static(b"{}")).await.unwrap();

    let tree = client.tree().await.unwrap();
    assert_eq!(tree.key, "/volplugin");
    assert!(tree.dir);
    assert_eq!(tree.nodes[0].key, "/volplugin/policies");
    assert_eq!(tree.nodes[0].nodes[0].value, Bytes::from_static(b"{}"));
}

#[tokio::test]
async fn test_watch_reports_puts_and_deletes() {
    let (_, client) = client().await;
    let mut watch = client.watch("volumes", true).await.unwrap();

    client.put("volumes/a/v1", Bytes::from_static(b"1")).await.unwrap();
    client.put("policies/a", Bytes::from_static(b"{}")).await.unwrap();
    client.delete("volumes/a/v1").await.unwrap();

    let put = watch.next().await.unwrap();
    assert_eq!(put.kind, EventKind::Put);
    assert_eq!(put.key, "volumes/a/v1");
    assert_eq!(put.value, Bytes::from_static(b"1"));

    let delete = watch.next().await.unwrap();
    assert_eq!(delete.kind, EventKind::Delete);
    assert_eq!(delete.key, "volumes/a/v1");
    assert!(delete.value.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_excludes_other_payloads() {
    let (_, client) = client().await;
    client.acquire(lock("mon0")).await.unwrap();
    assert!(client.acquire(lock("mon1")).await.unwrap_err().is_lock_failed());

    // Re-acquiring with the same payload succeeds
    client.acquire(lock("mon0")).await.unwrap();
    assert_eq!(client.held_locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_outlives_its_lease() {
    let (_, client) = client().await;
    client.acquire(lock("mon0")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(client.acquire_with_ttl(lock("mon1"), Duration::from_secs(5)).await.unwrap_err().is_lock_failed());
    assert_eq!(client.get("users/volume/policy/vol").await.unwrap().value, lock("mon0").payload);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_lock_lapses() {
    let (_, client) = client().await;
    client.acquire_with_ttl(lock("mon0"), Duration::from_secs(10)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(client.acquire_with_ttl(lock("mon1"), Duration::from_secs(10)).await.unwrap_err().is_lock_failed());

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.acquire_with_ttl(lock("mon1"), Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
async fn test_zero_ttl_is_refused() {
    let (_, client) = client().await;
    assert!(client.acquire_with_ttl(lock("mon0"), Duration::ZERO).await.unwrap_err().is_lock_failed());
    assert!(client.acquire_and_refresh(lock("mon0"), Duration::ZERO).await.unwrap_err().is_lock_failed());
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_lock_is_kept_then_released() {
    let (_, client) = client().await;
    let ttl = Duration::from_secs(8);
    let handle = client.acquire_and_refresh(lock("mon0"), ttl).await.unwrap();

    tokio::time::sleep(ttl * 5).await;
    assert!(client.acquire_with_ttl(lock("mon1"), ttl).await.unwrap_err().is_lock_failed());

    handle.stop();
    tokio::time::sleep(ttl / 4).await;
    client.acquire_with_ttl(lock("mon1"), ttl).await.unwrap();
    assert_eq!(client.held_locks(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_refresher_gives_up_when_lock_is_taken_over() {
    let (keyspace, client) = client().await;
    let ttl = Duration::from_secs(8);
    let _handle = client.acquire_and_refresh(lock("mon0"), ttl).await.unwrap();
    assert_eq!(client.held_locks(), 1);

    keyspace
        .set("/volplugin/users/volume/policy/vol", "intruder", SetOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(ttl / 2).await;

    assert_eq!(client.held_locks(), 0);
    assert!(logs_contain("lock lost before refresh"));
}

#[tokio::test]
async fn test_free_checks_payload_unless_forced() {
    let (_, client) = client().await;
    client.acquire(lock("mon0")).await.unwrap();

    assert!(client.free(lock("mon1"), false).await.unwrap_err().is_lock_failed());
    assert_eq!(client.held_locks(), 1);

    client.free(lock("mon1"), true).await.unwrap();
    assert_eq!(client.held_locks(), 0);
    client.acquire(lock("mon1")).await.unwrap();

    client.free(lock("mon1"), false).await.unwrap();
    assert!(client.free(lock("mon1"), true).await.unwrap_err().is_not_exists());
}

#[tokio::test]
async fn test_stale_holder_free_leaves_new_owner() {
    let (keyspace, stale) = client().await;
    stale.acquire(lock("mon0")).await.unwrap();

    keyspace
        .set("/volplugin/users/volume/policy/vol", "intruder", SetOptions::default())
        .await
        .unwrap();

    assert!(stale.free(lock("mon0"), false).await.unwrap_err().is_lock_failed());
    assert_eq!(stale.held_locks(), 0);
    assert_eq!(stale.get("users/volume/policy/vol").await.unwrap().value, Bytes::from_static(b"intruder"));
}
