use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tempfile::TempDir;
use volstore::Backend;
use volstore::Global;

use crate::common::create_volume;
use crate::common::store;
use crate::common::KINDS;

fn archive_files(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        files.insert(name, body);
    }
    files
}

#[tokio::test]
async fn test_dump_captures_whole_keyspace() {
    for kind in KINDS {
        let store = store(kind).await;
        store.set(&mut Global::new()).await.unwrap();
        create_volume(&store, "basic", "data").await;

        let dir = TempDir::new().unwrap();
        let path = store.dump(Some(dir.path())).await.unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("volplugin_dump_"), "{kind:?}: {file_name}");
        let base = file_name.trim_end_matches(".tar.gz");

        let files = archive_files(&path);
        let names: Vec<_> = files
            .keys()
            .map(|k| k.strip_prefix(base).unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "/volplugin/global-config",
                "/volplugin/policies/basic",
                "/volplugin/runtime-policies/basic/data",
                "/volplugin/volumes/basic/data",
            ],
            "{kind:?}"
        );

        let raw = store.backend().get("volumes/basic/data").await.unwrap();
        assert_eq!(files[&format!("{base}/volplugin/volumes/basic/data")], raw.value.to_vec());
    }
}

#[tokio::test]
async fn test_dump_of_empty_keyspace() {
    for kind in KINDS {
        let store = store(kind).await;
        let dir = TempDir::new().unwrap();
        let path = store.dump(Some(dir.path())).await.unwrap();
        assert!(archive_files(&path).is_empty(), "{kind:?}");
    }
}
