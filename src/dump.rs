//! Keyspace dumps.
//!
//! Both backends reduce their keyspace to a [`Node`] tree, which is written
//! as a gzip tarball rooted at the archive's own basename so extraction
//! reproduces the keyspace layout below one directory.

use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;
use tar::EntryType;
use tar::Header;
use tracing::debug;
use tracing::info;

use crate::constants::DUMP_INFIX;
use crate::constants::DUMP_TIMESTAMP_FORMAT;
use crate::Result;

/// Backend independent keyspace tree. Keys are absolute keyspace keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: Bytes,
    pub dir: bool,
    pub nodes: Vec<Node>,
}

impl Node {
    pub fn dir(
        key: impl Into<String>,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            key: key.into(),
            dir: true,
            nodes,
            ..Default::default()
        }
    }

    pub fn leaf(
        key: impl Into<String>,
        value: Bytes,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            ..Default::default()
        }
    }

    /// Rebuilds directory boundaries from flat `(key, value)` pairs found
    /// under `root`.
    pub fn from_flat(
        root: &str,
        entries: impl IntoIterator<Item = (String, Bytes)>,
    ) -> Self {
        let root = root.trim_end_matches('/');
        let mut tree = Node::dir(root, Vec::new());

        for (key, value) in entries {
            let rel = key
                .strip_prefix(root)
                .unwrap_or(&key)
                .trim_matches('/')
                .to_string();
            let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
            if segments.is_empty() {
                continue;
            }
            tree.insert(root, &segments, value);
        }

        tree.sort();
        tree
    }

    fn insert(
        &mut self,
        parent_key: &str,
        segments: &[&str],
        value: Bytes,
    ) {
        let key = format!("{}/{}", parent_key, segments[0]);
        if segments.len() == 1 {
            self.nodes.push(Node::leaf(key, value));
            return;
        }

        let pos = match self.nodes.iter().position(|n| n.dir && n.key == key) {
            Some(pos) => pos,
            None => {
                self.nodes.push(Node::dir(key.clone(), Vec::new()));
                self.nodes.len() - 1
            }
        };
        self.nodes[pos].insert(&key, &segments[1..], value);
    }

    fn sort(&mut self) {
        self.nodes.sort_by(|a, b| a.key.cmp(&b.key));
        for node in &mut self.nodes {
            node.sort();
        }
    }

    /// Looks up a node by absolute key anywhere in the tree.
    pub fn find(
        &self,
        key: &str,
    ) -> Option<&Node> {
        if self.key == key {
            return Some(self);
        }
        self.nodes.iter().find_map(|n| n.find(key))
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        if !self.dir {
            return 1;
        }
        self.nodes.iter().map(Node::leaf_count).sum()
    }
}

/// Dump file name stem for a keyspace prefix.
pub(crate) fn dump_stem(prefix: &str) -> String {
    let stamp = chrono::Local::now().format(DUMP_TIMESTAMP_FORMAT);
    format!("{}{}{}_", prefix.trim_matches('/').replace('/', "_"), DUMP_INFIX, stamp)
}

/// Writes `tree` into `<dir>/<stem><random>.tar.gz` and returns its path.
pub(crate) async fn write_archive(
    tree: Node,
    prefix: String,
    dir: PathBuf,
) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || write_archive_blocking(&tree, &prefix, &dir)).await?
}

fn write_archive_blocking(
    tree: &Node,
    prefix: &str,
    dir: &Path,
) -> Result<PathBuf> {
    let mut temp = tempfile::Builder::new()
        .prefix(&dump_stem(prefix))
        .tempfile_in(dir)?;

    let base = temp
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(path = %temp.path().display(), leaves = tree.leaf_count(), "writing keyspace dump");

    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let encoder = GzEncoder::new(BufWriter::new(temp.as_file_mut()), Compression::default());
    let mut builder = Builder::new(encoder);
    append_node(&mut builder, &base, tree, mtime)?;
    let mut out = builder.into_inner()?.finish()?;
    out.flush()?;
    drop(out);

    let mut final_name = temp.path().as_os_str().to_os_string();
    final_name.push(".tar.gz");
    let final_path = PathBuf::from(final_name);
    // an unpersisted temp file is removed on drop
    temp.persist(&final_path).map_err(io::Error::from)?;

    info!(path = %final_path.display(), "keyspace dump written");
    Ok(final_path)
}

fn append_node<W: io::Write>(
    builder: &mut Builder<W>,
    base: &str,
    node: &Node,
    mtime: u64,
) -> io::Result<()> {
    let name = format!("{}/{}", base, node.key.trim_start_matches('/'));
    let mut header = Header::new_gnu();
    header.set_mtime(mtime);

    if node.dir {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o700);
        header.set_size(0);
        builder.append_data(&mut header, &name, io::empty())?;
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(node.value.len() as u64);
        builder.append_data(&mut header, &name, node.value.as_ref())?;
    }

    for child in &node.nodes {
        append_node(builder, base, child, mtime)?;
    }
    Ok(())
}
