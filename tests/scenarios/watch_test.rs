use std::time::Duration;

use volstore::BackendKind;
use volstore::EventKind;
use volstore::Global;
use volstore::Policy;
use volstore::Volume;

use crate::common::ceph_policy;
use crate::common::create_volume;
use crate::common::next_event;
use crate::common::store;
use crate::common::KINDS;

#[tokio::test]
async fn test_volume_prefix_watch_sees_lifecycle() {
    for kind in KINDS {
        let store = store(kind).await;
        let mut watch = store.watch_prefix(&Volume::default()).await.unwrap();

        let volume = create_volume(&store, "basic", "data").await;
        let created = next_event(&mut watch).await;
        assert_eq!(created.kind, EventKind::Put, "{kind:?}");
        assert_eq!(created.entity, volume);

        store.delete(&mut Volume::new("basic", "data")).await.unwrap();
        let deleted = next_event(&mut watch).await;
        assert_eq!(deleted.kind, EventKind::Delete, "{kind:?}");
        assert_eq!((deleted.entity.policy.as_str(), deleted.entity.name.as_str()), ("basic", "data"));

        store.watch_prefix_stop(&Volume::default()).await.unwrap();
        assert!(watch.events.recv().await.is_none());
    }
}

#[tokio::test]
async fn test_single_record_watch() {
    for kind in KINDS {
        let store = store(kind).await;
        let mut watch = store.watch(&Global::new()).await.unwrap();

        let mut global = Global {
            debug: true,
            ..Global::new()
        };
        store.set(&mut global).await.unwrap();

        let event = next_event(&mut watch).await;
        assert_eq!(event.entity, global, "{kind:?}");
        assert!(watch.errors.try_recv().is_err());
        assert_eq!(store.watch_count(), 1);

        store.watch_stop(&Global::new()).await.unwrap();
        assert_eq!(store.watch_count(), 0);
    }
}

#[tokio::test]
async fn test_dropping_receiver_ends_watch_task() {
    for kind in KINDS {
        let store = store(kind).await;
        let watch = store.watch_prefix(&Volume::default()).await.unwrap();
        drop(watch);

        create_volume(&store, "basic", "data").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // stopping an ended watch still succeeds
        store.watch_prefix_stop(&Volume::default()).await.unwrap();
        assert_eq!(store.watch_count(), 0);
    }
}

#[tokio::test]
async fn test_writes_made_before_reading_arrive_in_order() {
    for kind in KINDS {
        let store = store(kind).await;
        store.set(&mut ceph_policy("p0")).await.unwrap();
        let mut watch = store.watch_prefix(&Policy::default()).await.unwrap();

        // no await point yields to the watch task between these writes
        store.set(&mut ceph_policy("p1")).await.unwrap();
        store.delete(&mut Policy::new("p1")).await.unwrap();
        store.delete(&mut Policy::new("p0")).await.unwrap();
        store.set(&mut ceph_policy("p2")).await.unwrap();

        let expected: &[(EventKind, &str)] = match kind {
            BackendKind::Cas => &[
                (EventKind::Put, "p1"),
                (EventKind::Delete, "p1"),
                (EventKind::Delete, "p0"),
                (EventKind::Put, "p2"),
            ],
            // snapshots coalesce p1, which came and went between two answers
            BackendKind::Session => &[(EventKind::Delete, "p0"), (EventKind::Put, "p2")],
        };

        let mut seen = Vec::new();
        for _ in expected {
            let event = next_event(&mut watch).await;
            seen.push((event.kind, event.entity.name));
        }
        let seen: Vec<_> = seen.iter().map(|(k, n)| (*k, n.as_str())).collect();
        assert_eq!(seen, expected, "{kind:?}");

        let extra = tokio::time::timeout(Duration::from_millis(100), watch.events.recv()).await;
        assert!(extra.is_err(), "{kind:?}: unexpected event {extra:?}");
    }
}
