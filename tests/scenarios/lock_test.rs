use std::time::Duration;

use volstore::BackendKind;
use volstore::Use;
use volstore::Volume;

use crate::common::host_pair;
use crate::common::store;
use crate::common::KINDS;

fn volume() -> Volume {
    Volume::new("basic", "data")
}

#[tokio::test(start_paused = true)]
async fn test_mount_lock_is_exclusive_across_hosts() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        let lock_a = Use::mount_owner("host-a", &volume());
        let lock_b = Use::mount_owner("host-b", &volume());

        a.acquire(&lock_a).await.unwrap();
        let err = b.acquire(&lock_b).await.unwrap_err();
        assert!(err.is_lock_failed(), "{kind:?}: {err}");

        // the other host may not free what it does not hold
        assert!(b.free(&lock_b, false).await.unwrap_err().is_lock_failed());

        a.free(&lock_a, false).await.unwrap();
        b.acquire(&lock_b).await.unwrap();
        b.free(&lock_b, false).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_acquire_holds_beyond_its_lease() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        a.acquire(&Use::create_owner("host-a", &volume())).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3 * 900)).await;
        let err = b.acquire(&Use::create_owner("host-b", &volume())).await.unwrap_err();
        assert!(err.is_lock_failed(), "{kind:?}: {err}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_lock_lapses() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        let ttl = Duration::from_secs(15);
        a.acquire_with_ttl(&Use::snapshot_owner("host-a", &volume()), ttl)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(b
            .acquire_with_ttl(&Use::snapshot_owner("host-b", &volume()), ttl)
            .await
            .unwrap_err()
            .is_lock_failed());

        tokio::time::sleep(Duration::from_secs(11)).await;
        b.acquire_with_ttl(&Use::snapshot_owner("host-b", &volume()), ttl)
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_lock_released_on_stop() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        let ttl = Duration::from_secs(20);
        let handle = a
            .acquire_and_refresh(&Use::mount_owner("host-a", &volume()), ttl)
            .await
            .unwrap();

        tokio::time::sleep(ttl * 3).await;
        assert!(b
            .acquire(&Use::mount_owner("host-b", &volume()))
            .await
            .unwrap_err()
            .is_lock_failed());

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.acquire(&Use::mount_owner("host-b", &volume())).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_forced_free_breaks_foreign_lock() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        a.acquire(&Use::mount_owner("host-a", &volume())).await.unwrap();

        b.free(&Use::remove_owner("host-b", &volume()), true).await.unwrap();
        b.acquire(&Use::remove_owner("host-b", &volume())).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_holder_cannot_free_after_takeover() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        let lock_a = Use::mount_owner("host-a", &volume());
        let lock_b = Use::mount_owner("host-b", &volume());

        a.acquire(&lock_a).await.unwrap();
        b.free(&lock_b, true).await.unwrap();
        b.acquire(&lock_b).await.unwrap();

        let err = a.free(&lock_a, false).await.unwrap_err();
        assert!(err.is_lock_failed(), "{kind:?}: {err}");

        let mut record = Use::new(&volume());
        b.get(&mut record).await.unwrap();
        assert_eq!(record, lock_b, "{kind:?}");

        let err = a.acquire(&lock_a).await.unwrap_err();
        assert!(err.is_lock_failed(), "{kind:?}: {err}");
        b.free(&lock_b, false).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_identical_payload_from_another_host() {
    for kind in KINDS {
        let (a, b) = host_pair(kind).await;
        let lock = Use::mount_owner("host-a", &volume());
        a.acquire(&lock).await.unwrap();

        // the CAS lock is its payload; a session lock is bound to its session
        let second = b.acquire(&lock).await;
        match kind {
            BackendKind::Cas => second.unwrap(),
            BackendKind::Session => assert!(second.unwrap_err().is_lock_failed()),
        }

        a.free(&lock, false).await.unwrap();
    }
}

#[tokio::test]
async fn test_zero_ttl_is_refused() {
    for kind in KINDS {
        let store = store(kind).await;
        let err = store
            .acquire_with_ttl(&Use::mount_owner("host-a", &volume()), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_lock_failed(), "{kind:?}: {err}");
    }
}
