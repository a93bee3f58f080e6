use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::cas_code;
use crate::Error;
use crate::TransportError;

fn cas_code_of(e: Error) -> u64 {
    match e {
        Error::Transport(TransportError::Cas(e)) => e.code,
        other => panic!("expected a raw cas error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_set_creates_intermediate_directories() {
    let ks = MemCasKeyspace::default();
    let resp = ks.set("/a/b/c", "v", SetOptions::default()).await.unwrap();
    assert_eq!(resp.action, CasAction::Set);
    assert_eq!(resp.node.key, "/a/b/c");

    let dir = ks.get("/a", GetOptions::default()).await.unwrap();
    assert!(dir.node.dir);
    assert_eq!(dir.node.nodes.len(), 1);
    assert_eq!(dir.node.nodes[0].key, "/a/b");
    assert!(dir.node.nodes[0].nodes.is_empty(), "non-recursive get lists one level");

    let all = ks
        .get(
            "/a",
            GetOptions {
                recursive: true,
                sorted: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(all.node.nodes[0].nodes[0].value, "v");
}

#[tokio::test]
async fn test_missing_key_is_not_exists() {
    let ks = MemCasKeyspace::default();
    let err = ks.get("/nope", GetOptions::default()).await.unwrap_err();
    assert!(err.is_not_exists());
    let err = ks.delete("/nope", DeleteOptions::default()).await.unwrap_err();
    assert!(err.is_not_exists());
}

#[tokio::test]
async fn test_prev_exist_and_prev_value_conditions() {
    let ks = MemCasKeyspace::default();

    let create = SetOptions {
        prev_exist: Some(PrevExist::NoExist),
        ..Default::default()
    };
    assert_eq!(ks.set("/k", "one", create.clone()).await.unwrap().action, CasAction::Create);
    assert!(ks.set("/k", "two", create).await.unwrap_err().is_exists());

    let swap = |prev: &str| SetOptions {
        prev_value: Some(prev.to_string()),
        ..Default::default()
    };
    assert!(ks.set("/k", "two", swap("zero")).await.unwrap_err().is_lock_failed());
    let resp = ks.set("/k", "two", swap("one")).await.unwrap();
    assert_eq!(resp.action, CasAction::CompareAndSwap);
    assert_eq!(resp.prev_node.unwrap().value, "one");

    assert!(ks.set("/other", "x", swap("x")).await.unwrap_err().is_not_exists());

    let update = SetOptions {
        prev_exist: Some(PrevExist::Exist),
        ..Default::default()
    };
    assert!(ks.set("/other", "x", update).await.unwrap_err().is_not_exists());
}

#[tokio::test]
async fn test_file_and_directory_conflicts() {
    let ks = MemCasKeyspace::default();
    ks.set("/file", "x", SetOptions::default()).await.unwrap();

    let err = ks.set("/file/child", "y", SetOptions::default()).await.unwrap_err();
    assert_eq!(cas_code_of(err), cas_code::NOT_DIR);

    ks.set("/dir/child", "y", SetOptions::default()).await.unwrap();
    let err = ks.set("/dir", "z", SetOptions::default()).await.unwrap_err();
    assert_eq!(cas_code_of(err), cas_code::NOT_FILE);

    let err = ks.delete("/dir", DeleteOptions::default()).await.unwrap_err();
    assert_eq!(cas_code_of(err), cas_code::NOT_FILE);

    let dir_only = DeleteOptions {
        dir: true,
        ..Default::default()
    };
    let err = ks.delete("/dir", dir_only).await.unwrap_err();
    assert_eq!(cas_code_of(err), cas_code::DIR_NOT_EMPTY);

    let recursive = DeleteOptions {
        recursive: true,
        ..Default::default()
    };
    ks.delete("/dir", recursive).await.unwrap();
    assert!(ks.get("/dir/child", GetOptions::default()).await.unwrap_err().is_not_exists());
}

#[tokio::test]
async fn test_compare_and_delete() {
    let ks = MemCasKeyspace::default();
    ks.set("/lock", "mine", SetOptions::default()).await.unwrap();

    let theirs = DeleteOptions {
        prev_value: Some("theirs".to_string()),
        ..Default::default()
    };
    assert!(ks.delete("/lock", theirs).await.unwrap_err().is_lock_failed());

    let mine = DeleteOptions {
        prev_value: Some("mine".to_string()),
        ..Default::default()
    };
    let resp = ks.delete("/lock", mine).await.unwrap();
    assert_eq!(resp.action, CasAction::CompareAndDelete);
    assert_eq!(resp.action.kind(), EventKind::Delete);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expires_key() {
    let ks = MemCasKeyspace::default();
    let opts = SetOptions {
        ttl: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let resp = ks.set("/lease", "x", opts).await.unwrap();
    assert_eq!(resp.node.ttl, Some(5));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(ks.get("/lease", GetOptions::default()).await.is_ok());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(ks.get("/lease", GetOptions::default()).await.unwrap_err().is_not_exists());
}

#[tokio::test]
async fn test_index_advances_per_write() {
    let ks = MemCasKeyspace::default();
    assert_eq!(ks.index().await.unwrap(), 0);
    ks.set("/a", "1", SetOptions::default()).await.unwrap();
    ks.set("/a", "2", SetOptions::default()).await.unwrap();
    assert_eq!(ks.index().await.unwrap(), 2);

    let node = ks.get("/a", GetOptions::default()).await.unwrap().node;
    assert_eq!(node.created_index, 1);
    assert_eq!(node.modified_index, 2);
}

#[tokio::test]
async fn test_watch_replays_history_from_index() {
    let ks = MemCasKeyspace::default();
    ks.set("/w/a", "1", SetOptions::default()).await.unwrap();
    ks.set("/other", "x", SetOptions::default()).await.unwrap();
    ks.set("/w/b", "2", SetOptions::default()).await.unwrap();

    let opts = |wait_index| WatchOptions {
        recursive: true,
        wait_index,
    };
    let first = ks.watch("/w", opts(1)).await.unwrap();
    assert_eq!(first.node.key, "/w/a");
    let second = ks.watch("/w", opts(first.node.modified_index + 1)).await.unwrap();
    assert_eq!(second.node.key, "/w/b");

    let exact = WatchOptions {
        recursive: false,
        wait_index: 1,
    };
    assert_eq!(ks.watch("/other", exact).await.unwrap().node.value, "x");
}

#[tokio::test]
async fn test_watch_blocks_until_next_write() {
    let ks = Arc::new(MemCasKeyspace::default());
    let next = ks.index().await.unwrap() + 1;
    let watcher = {
        let ks = ks.clone();
        tokio::spawn(async move {
            ks.watch(
                "/w",
                WatchOptions {
                    recursive: true,
                    wait_index: next,
                },
            )
            .await
        })
    };
    tokio::task::yield_now().await;

    ks.set("/w/x", "new", SetOptions::default()).await.unwrap();
    let event = watcher.await.unwrap().unwrap();
    assert_eq!(event.node.key, "/w/x");
    assert_eq!(event.action.kind(), EventKind::Put);
}

#[tokio::test(start_paused = true)]
async fn test_watch_observes_expiry() {
    let ks = Arc::new(MemCasKeyspace::default());
    let opts = SetOptions {
        ttl: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let index = ks.set("/lease", "x", opts).await.unwrap().index;

    let event = ks
        .watch(
            "/lease",
            WatchOptions {
                recursive: false,
                wait_index: index + 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(event.action, CasAction::Expire);
    assert_eq!(event.prev_node.unwrap().value, "x");
}

#[tokio::test]
async fn test_watch_on_cleared_index_fails() {
    let ks = MemCasKeyspace::new(2);
    for i in 0..5 {
        ks.set("/k", &i.to_string(), SetOptions::default()).await.unwrap();
    }

    let err = ks
        .watch(
            "/k",
            WatchOptions {
                recursive: false,
                wait_index: 1,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(cas_code_of(err), cas_code::EVENT_INDEX_CLEARED);
}
