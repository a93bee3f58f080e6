use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing_test::traced_test;

use super::*;
use crate::BackendConfig;
use crate::MockBackend;
use crate::RawEntry;
use crate::RawEvent;
use crate::TransportError;
use crate::Use;
use crate::Volume;

fn mocked(backend: MockBackend) -> Store {
    Store::new(Arc::new(backend), StoreConfig::default())
}

fn basic_policy() -> Policy {
    let mut policy = Policy::new("basic");
    policy.backend = "ceph".to_string();
    policy.create.size = "10MB".to_string();
    policy
}

async fn session_store() -> Store {
    let config = StoreConfig {
        backend: BackendConfig {
            kind: BackendKind::Session,
            ..Default::default()
        },
        ..Default::default()
    };
    Store::in_memory(config).await.unwrap()
}

/// Fails once, then never yields again.
struct FailingWatch {
    failed: bool,
}

#[async_trait]
impl NativeWatch for FailingWatch {
    async fn next(&mut self) -> Result<RawEvent> {
        if !self.failed {
            self.failed = true;
            return Err(Error::Transport(TransportError::Session("connection refused".into())));
        }
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_set_rejects_invalid_entity_without_io() {
    let mut backend = MockBackend::new();
    backend.expect_put().never();
    let store = mocked(backend);

    let mut policy = Policy::new("basic");
    let err = store.set(&mut policy).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
}

#[tokio::test]
async fn test_set_writes_canonical_payload_at_path() {
    let mut backend = MockBackend::new();
    backend.expect_put().times(1).returning(|path, value| {
        assert_eq!(path, "policies/basic");
        let stored: Policy = decode(&value).unwrap();
        assert_eq!(stored.backends.unwrap().crud, "ceph");
        Ok(())
    });
    let store = mocked(backend);

    let mut policy = basic_policy();
    store.set(&mut policy).await.unwrap();
    // validate filled the derived driver set in place
    assert!(policy.backends.is_some());
}

#[tokio::test]
async fn test_get_restores_identity_from_key() {
    let mut stored = basic_policy();
    stored.validate().unwrap();
    let payload = encode(&stored).unwrap();

    let mut backend = MockBackend::new();
    backend.expect_get().times(1).returning(move |path| {
        assert_eq!(path, "policies/basic");
        Ok(RawEntry {
            key: "policies/basic".to_string(),
            value: payload.clone(),
        })
    });
    let store = mocked(backend);

    let mut policy = Policy::new("basic");
    store.get(&mut policy).await.unwrap();
    assert_eq!(policy, stored);
}

#[tokio::test]
async fn test_get_without_identity_fails_before_io() {
    let mut backend = MockBackend::new();
    backend.expect_get().never();
    let store = mocked(backend);

    let err = store.get(&mut Policy::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPath(_)), "{err}");
}

#[tokio::test]
async fn test_delete_of_missing_record_succeeds() {
    let mut backend = MockBackend::new();
    backend
        .expect_delete()
        .times(1)
        .returning(|path| Err(Error::NotExists(path.to_string())));
    let store = mocked(backend);

    store.delete(&mut Policy::new("gone")).await.unwrap();
}

#[tokio::test]
async fn test_delete_propagates_transport_errors() {
    let mut backend = MockBackend::new();
    backend
        .expect_delete()
        .returning(|_| Err(Error::Transport(TransportError::Timeout(Duration::from_secs(1)))));
    let store = mocked(backend);

    let err = store.delete(&mut Policy::new("basic")).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Timeout(_))));
}

#[tokio::test]
#[traced_test]
async fn test_list_skips_malformed_records() {
    let mut good = basic_policy();
    good.validate().unwrap();
    let payload = encode(&good).unwrap();

    let mut backend = MockBackend::new();
    backend.expect_list().times(1).returning(move |path| {
        assert_eq!(path, "policies");
        Ok(vec![
            RawEntry {
                key: "policies/basic".to_string(),
                value: payload.clone(),
            },
            RawEntry {
                key: "policies/broken".to_string(),
                value: Bytes::from_static(b"{not json"),
            },
            RawEntry {
                key: "policies/nested/too/deep".to_string(),
                value: payload.clone(),
            },
        ])
    });
    let store = mocked(backend);

    let policies = store.list(&Policy::default()).await.unwrap();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].name, "basic");
    assert!(logs_contain("skipping malformed record"));
}

#[tokio::test]
async fn test_list_prefix_narrows_path() {
    let mut backend = MockBackend::new();
    backend.expect_list().times(1).returning(|path| {
        assert_eq!(path, "volumes/basic");
        Ok(Vec::new())
    });
    let store = mocked(backend);

    let volumes = store.list_prefix("/basic/", &Volume::default()).await.unwrap();
    assert!(volumes.is_empty());
}

#[tokio::test]
async fn test_lock_without_identity_is_lock_failed() {
    let mut backend = MockBackend::new();
    backend.expect_acquire().never();
    let store = mocked(backend);

    let err = store.acquire(&Use::default()).await.unwrap_err();
    assert!(err.is_lock_failed(), "{err}");
}

#[tokio::test]
async fn test_lock_request_carries_encoded_lock() {
    let volume = Volume::new("basic", "vol");
    let lock = Use::create_owner("host-a", &volume);
    let expected = encode(&lock).unwrap();

    let mut backend = MockBackend::new();
    backend.expect_acquire_with_ttl().times(1).returning(move |req, ttl| {
        assert_eq!(req.path, "users/volume/basic/vol");
        assert_eq!(req.payload, expected);
        assert_eq!(ttl, Duration::from_secs(30));
        Ok(())
    });
    let store = mocked(backend);

    store.acquire_with_ttl(&lock, Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_watch_forwards_errors_and_keeps_running() {
    let mut backend = MockBackend::new();
    backend
        .expect_watch()
        .times(1)
        .returning(|_, _| Ok(Box::new(FailingWatch { failed: false }) as Box<dyn NativeWatch>));
    let store = mocked(backend);

    let mut watch = store.watch_prefix(&Policy::default()).await.unwrap();
    let err = watch.errors.recv().await.unwrap();
    assert!(matches!(err, Error::Transport(TransportError::Session(_))));
    assert_eq!(store.watch_count(), 1);
    assert!(logs_contain("watch poll failed"));

    store.watch_prefix_stop(&Policy::default()).await.unwrap();
    assert_eq!(store.watch_count(), 0);
    assert!(watch.events.recv().await.is_none());
}

#[tokio::test]
async fn test_watch_prefix_delivers_puts_and_deletes() {
    for store in [Store::in_memory(StoreConfig::default()).await.unwrap(), session_store().await] {
        let mut watch = store.watch_prefix(&Policy::default()).await.unwrap();

        let mut policy = basic_policy();
        store.set(&mut policy).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), watch.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.entity, policy);

        store.delete(&mut Policy::new("basic")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), watch.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.entity.name, "basic");
        assert!(event.entity.backends.is_none());

        store.watch_prefix_stop(&Policy::default()).await.unwrap();
    }
}

#[tokio::test]
async fn test_second_watch_on_path_supersedes_first() {
    let store = Store::in_memory(StoreConfig::default()).await.unwrap();
    let policy = Policy::new("basic");

    let mut first = store.watch(&policy).await.unwrap();
    let mut second = store.watch(&policy).await.unwrap();
    assert_eq!(store.watch_count(), 1);
    assert!(first.events.recv().await.is_none());

    store.set(&mut basic_policy()).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), second.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.entity.name, "basic");
}

#[tokio::test]
async fn test_watch_stop_on_unwatched_path_is_ok() {
    let store = Store::in_memory(StoreConfig::default()).await.unwrap();
    store.watch_stop(&Policy::new("nothing")).await.unwrap();
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_publish_policy_archives_revision() {
    for store in [Store::in_memory(StoreConfig::default()).await.unwrap(), session_store().await] {
        let mut policy = basic_policy();
        let revision = store.publish_policy(&mut policy).await.unwrap();
        assert!(revision.revision > 0);

        let revisions = store.list_policy_revisions("basic").await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].policy, policy);

        let archived = store.get_policy_revision("basic", revision.revision).await.unwrap();
        assert_eq!(archived, revision);

        let err = store.get_policy_revision("basic", 1).await.unwrap_err();
        assert!(err.is_not_exists(), "{err}");
    }
}
