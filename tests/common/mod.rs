use std::sync::Arc;
use std::time::Duration;

use volstore::cas::CasClient;
use volstore::cas::MemCasKeyspace;
use volstore::session::MemSessionKeyspace;
use volstore::session::SessionClient;
use volstore::BackendConfig;
use volstore::BackendKind;
use volstore::Entity;
use volstore::LockConfig;
use volstore::Policy;
use volstore::Store;
use volstore::StoreConfig;
use volstore::Volume;
use volstore::VolumeRequest;
use volstore::Watch;
use volstore::WatchEvent;

pub const KINDS: [BackendKind; 2] = [BackendKind::Cas, BackendKind::Session];

// generous bound for an event that is expected to arrive
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn config(kind: BackendKind) -> StoreConfig {
    StoreConfig {
        backend: BackendConfig {
            kind,
            ..Default::default()
        },
        lock: LockConfig {
            refresh_jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
    .validate()
    .unwrap()
}

pub async fn store(kind: BackendKind) -> Store {
    Store::in_memory(config(kind)).await.unwrap()
}

/// Two independent stores, as two hosts would hold, over one keyspace.
pub async fn host_pair(kind: BackendKind) -> (Store, Store) {
    let config = config(kind);
    let prefix = config.backend.prefix.clone();

    match kind {
        BackendKind::Cas => {
            let keyspace = Arc::new(MemCasKeyspace::default());
            let a = CasClient::connect(keyspace.clone(), &prefix, config.lock.clone())
                .await
                .unwrap();
            let b = CasClient::connect(keyspace, &prefix, config.lock.clone())
                .await
                .unwrap();
            (
                Store::new(Arc::new(a), config.clone()),
                Store::new(Arc::new(b), config),
            )
        }
        BackendKind::Session => {
            let keyspace = Arc::new(MemSessionKeyspace::new());
            let a = SessionClient::new(
                keyspace.clone(),
                &prefix,
                config.lock.clone(),
                config.watch.clone(),
            )
            .unwrap();
            let b = SessionClient::new(keyspace, &prefix, config.lock.clone(), config.watch.clone()).unwrap();
            (
                Store::new(Arc::new(a), config.clone()),
                Store::new(Arc::new(b), config),
            )
        }
    }
}

pub fn ceph_policy(name: &str) -> Policy {
    let mut policy = Policy::new(name);
    policy.backend = "ceph".to_string();
    policy.create.size = "10MB".to_string();
    policy
}

pub async fn create_volume(
    store: &Store,
    policy: &str,
    name: &str,
) -> Volume {
    let mut policy = ceph_policy(policy);
    store.set(&mut policy).await.unwrap();

    let mut volume = Volume::create(VolumeRequest {
        name: name.to_string(),
        policy: Some(policy),
        options: Default::default(),
    })
    .unwrap();
    store.set(&mut volume).await.unwrap();
    volume
}

pub async fn next_event<E: Entity>(watch: &mut Watch<E>) -> WatchEvent<E> {
    tokio::time::timeout(EVENT_TIMEOUT, watch.events.recv())
        .await
        .expect("watch event timed out")
        .expect("watch ended")
}
