use bytes::Bytes;
use volstore::Backend;
use volstore::Global;
use volstore::Policy;
use volstore::Use;
use volstore::Volume;
use volstore::VolumeRuntime;

use crate::common::ceph_policy;
use crate::common::create_volume;
use crate::common::store;
use crate::common::KINDS;

#[tokio::test]
async fn test_global_round_trip() {
    for kind in KINDS {
        let store = store(kind).await;
        let mut global = Global {
            debug: true,
            ..Global::new()
        };
        store.set(&mut global).await.unwrap();

        let mut loaded = Global::new();
        store.get(&mut loaded).await.unwrap();
        assert_eq!(loaded, global, "{kind:?}");
        assert_eq!(loaded.mount_path, "/mnt");
    }
}

#[tokio::test]
async fn test_missing_records_are_not_exists() {
    for kind in KINDS {
        let store = store(kind).await;
        let err = store.get(&mut Policy::new("nope")).await.unwrap_err();
        assert!(err.is_not_exists(), "{kind:?}: {err}");

        let err = store.get(&mut Volume::new("nope", "vol")).await.unwrap_err();
        assert!(err.is_not_exists(), "{kind:?}: {err}");

        assert!(store.list(&Policy::default()).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_policy_listing_skips_foreign_records() {
    for kind in KINDS {
        let store = store(kind).await;
        for name in ["alpha", "beta"] {
            store.set(&mut ceph_policy(name)).await.unwrap();
        }
        // written around the entity layer, as migration tooling does
        store
            .backend()
            .put("policies/corrupt", Bytes::from_static(b"<xml/>"))
            .await
            .unwrap();

        let names: Vec<_> = store
            .list(&Policy::default())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"], "{kind:?}");
    }
}

#[tokio::test]
async fn test_policy_revisions_accumulate() {
    for kind in KINDS {
        let store = store(kind).await;
        let mut policy = ceph_policy("basic");
        let first = store.publish_policy(&mut policy).await.unwrap();

        // a revision from an earlier publish, keyed one minute back
        let mut older = volstore::PolicyRevision::new(policy.clone(), first.revision - 60);
        store.set(&mut older).await.unwrap();

        let revisions = store.list_policy_revisions("basic").await.unwrap();
        let stamps: Vec<_> = revisions.iter().map(|r| r.revision).collect();
        assert_eq!(stamps, vec![first.revision - 60, first.revision], "{kind:?}");
    }
}

#[tokio::test]
async fn test_volume_lifecycle() {
    for kind in KINDS {
        let store = store(kind).await;
        let volume = create_volume(&store, "basic", "data").await;

        let mut loaded = Volume::new("basic", "data");
        store.get(&mut loaded).await.unwrap();
        assert_eq!(loaded, volume, "{kind:?}");

        let mut runtime = VolumeRuntime::new("basic", "data");
        store.get(&mut runtime).await.unwrap();

        store.delete(&mut loaded).await.unwrap();
        assert!(store.get(&mut Volume::new("basic", "data")).await.unwrap_err().is_not_exists());
        assert!(store.get(&mut runtime).await.unwrap_err().is_not_exists());
        // deleting twice is harmless
        store.delete(&mut Volume::new("basic", "data")).await.unwrap();
    }
}

#[tokio::test]
async fn test_use_record_readable_by_identity() {
    for kind in KINDS {
        let store = store(kind).await;
        let volume = create_volume(&store, "basic", "data").await;
        store.acquire(&Use::mount_owner("host-a", &volume)).await.unwrap();

        let mut holder = Use::new(&volume);
        store.get(&mut holder).await.unwrap();
        assert_eq!(holder.owner, "host-a", "{kind:?}");
        assert_eq!(holder.reason, "Use");

        store.free(&Use::mount_owner("host-a", &volume), false).await.unwrap();
    }
}
