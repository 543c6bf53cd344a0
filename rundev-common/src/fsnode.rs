//! Filesystem tree model and its 64-bit fingerprint.
//!
//! A [`FsNode`] tree is derived on demand by walking the sync directory and
//! is compared across hosts purely through fingerprints. Two normalizations
//! keep the fingerprint stable through an archive round trip:
//!
//! - mtimes are truncated to whole seconds in UTC (tar stores seconds),
//! - directories carry zero size and epoch-zero mtime, so a directory's
//!   fingerprint depends only on its children.

use std::fs;
use std::hash::Hasher;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ignore::{is_ignored, FileIgnores};

/// Sentinel name for the walk root. The value never participates in the
/// root fingerprint; it only has to be identical on both ends since the
/// sync directory basenames may differ.
pub const ROOT_NODE_NAME: &str = "$root";

const FILE_TYPE_MASK: u32 = 0o170_000;
const FILE_TYPE_DIR: u32 = 0o040_000;

/// One filesystem entry as used for comparison.
///
/// Children are kept sorted by name with no duplicates so that fingerprints
/// are deterministic across hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsNode {
    /// Basename of the entry.
    pub name: String,
    /// Unix `st_mode`: file type and permission bits.
    pub mode: u32,
    /// Byte size for regular files; zero for directories and whiteouts.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Modification time, whole seconds, UTC. Epoch zero for directories.
    pub mtime: DateTime<Utc>,
    /// Child entries, sorted by name. Directories only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<FsNode>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl FsNode {
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// Fingerprint of the tree through its children only.
    ///
    /// The node's own name, mode, size, and mtime are deliberately excluded
    /// so the sync directory basename at each end may differ.
    pub fn root_checksum(&self) -> u64 {
        self.children_checksum()
    }

    /// Fingerprint of this node: name bytes, then little-endian size, mode,
    /// and mtime as unix nanoseconds, then the children fingerprint.
    pub fn checksum(&self) -> u64 {
        let mut h = FnvHasher::default();
        h.write(self.name.as_bytes());
        h.write(&self.size.to_le_bytes());
        h.write(&u64::from(self.mode).to_le_bytes());
        let nanos = self.mtime.timestamp().wrapping_mul(1_000_000_000) as u64;
        h.write(&nanos.to_le_bytes());
        h.write(&self.children_checksum().to_le_bytes());
        h.finish()
    }

    fn children_checksum(&self) -> u64 {
        let mut h = FnvHasher::default();
        for child in &self.nodes {
            h.write(&child.checksum().to_le_bytes());
        }
        h.finish()
    }
}

impl std::fmt::Display for FsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:o}) {} ({} nodes)", self.mode, self.name, self.nodes.len())
    }
}

pub fn mode_is_dir(mode: u32) -> bool {
    mode & FILE_TYPE_MASK == FILE_TYPE_DIR
}

/// Truncates a filesystem timestamp to whole seconds in UTC.
pub fn truncate_mtime(t: SystemTime) -> DateTime<Utc> {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    epoch_seconds(secs)
}

/// Epoch-zero timestamp used for directories and whiteout entries.
pub fn epoch_zero() -> DateTime<Utc> {
    epoch_seconds(0)
}

fn epoch_seconds(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Walks `dir` into an [`FsNode`] tree.
///
/// Entries are read in native order and sorted by name. Each entry's path
/// relative to `dir` (forward-slash form) is tested against `ignores`
/// before descending. Fails with [`Error::NotADirectory`] when `dir` is not
/// a directory.
pub fn walk(dir: &Path, ignores: Option<&FileIgnores>) -> Result<FsNode> {
    let meta = fs::symlink_metadata(dir)
        .map_err(|e| Error::io(format!("failed to open directory {}", dir.display()), e))?;
    if !meta.is_dir() {
        return Err(Error::NotADirectory(dir.to_path_buf()));
    }
    let mut root = walk_entry(dir, dir, &meta, ignores)?;
    root.name = ROOT_NODE_NAME.to_string();
    Ok(root)
}

fn walk_entry(
    root: &Path,
    path: &Path,
    meta: &fs::Metadata,
    ignores: Option<&FileIgnores>,
) -> Result<FsNode> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !meta.is_dir() {
        return Ok(FsNode {
            name,
            mode: meta.mode(),
            size: meta.len(),
            mtime: truncate_mtime(meta.modified().map_err(|e| {
                Error::io(format!("failed to read mtime of {}", path.display()), e)
            })?),
            nodes: Vec::new(),
        });
    }

    let mut entries: Vec<_> = fs::read_dir(path)
        .map_err(|e| Error::io(format!("failed to list directory {}", path.display()), e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::io(format!("failed to list directory {}", path.display()), e))?;
    entries.sort_by_key(|e| e.file_name());

    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let child_path = entry.path();
        let rel = relative_slash_path(root, &child_path);
        if is_ignored(ignores, &rel) {
            continue;
        }
        let child_meta = fs::symlink_metadata(&child_path).map_err(|e| {
            Error::io(format!("failed to stat {}", child_path.display()), e)
        })?;
        nodes.push(walk_entry(root, &child_path, &child_meta, ignores)?);
    }

    Ok(FsNode {
        name,
        mode: meta.mode(),
        size: 0,
        mtime: epoch_zero(),
        nodes,
    })
}

/// Path of `child` relative to `root`, with forward slashes regardless of
/// the host platform.
pub fn relative_slash_path(root: &Path, child: &Path) -> String {
    let rel = child.strip_prefix(root).unwrap_or(child);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn walk_fails_on_non_directory() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "file.txt", "x");
        let err = walk(&tmp.path().join("file.txt"), None).unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));
    }

    #[test]
    fn walk_sorts_children_by_name() {
        let tmp = TempDir::new().unwrap();
        for name in ["zz.txt", "aa.txt", "mm.txt"] {
            write_file(tmp.path(), name, "x");
        }
        let tree = walk(tmp.path(), None).unwrap();
        let names: Vec<_> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["aa.txt", "mm.txt", "zz.txt"]);
    }

    #[test]
    fn walk_uses_root_sentinel_name() {
        let tmp = TempDir::new().unwrap();
        let tree = walk(tmp.path(), None).unwrap();
        assert_eq!(tree.name, ROOT_NODE_NAME);
    }

    #[test]
    fn directories_have_zero_size_and_epoch_mtime() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "sub/file.txt", "data");
        let tree = walk(tmp.path(), None).unwrap();
        let sub = &tree.nodes[0];
        assert!(sub.is_dir());
        assert_eq!(sub.size, 0);
        assert_eq!(sub.mtime, epoch_zero());
    }

    #[test]
    fn root_checksum_ignores_root_identity() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();
        write_file(tmp1.path(), "a.txt", "same");
        write_file(tmp2.path(), "a.txt", "same");
        // Align mtimes so only the directory names differ.
        let mtime = walk(tmp1.path(), None).unwrap().nodes[0].mtime;
        let mut t1 = walk(tmp1.path(), None).unwrap();
        let mut t2 = walk(tmp2.path(), None).unwrap();
        t1.nodes[0].mtime = mtime;
        t2.nodes[0].mtime = mtime;
        t2.name = "entirely-different".into();
        t2.mode = 0;
        assert_eq!(t1.root_checksum(), t2.root_checksum());
    }

    #[test]
    fn checksum_changes_with_content_size() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "a.txt", "v1");
        let before = walk(tmp.path(), None).unwrap().root_checksum();
        write_file(tmp.path(), "a.txt", "longer contents");
        let after = walk(tmp.path(), None).unwrap().root_checksum();
        assert_ne!(before, after);
    }

    #[test]
    fn checksum_changes_with_permissions() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "a.txt", "x");
        let before = walk(tmp.path(), None).unwrap().root_checksum();
        fs::set_permissions(tmp.path().join("a.txt"), fs::Permissions::from_mode(0o600))
            .unwrap();
        let after = walk(tmp.path(), None).unwrap().root_checksum();
        assert_ne!(before, after);
    }

    #[test]
    fn ignored_entries_are_excluded_from_walk() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "keep.txt", "x");
        write_file(tmp.path(), "skip.log", "x");
        write_file(tmp.path(), "target/out.bin", "x");
        let ignores = FileIgnores::new(&["*.log", "target"]).unwrap();
        let tree = walk(tmp.path(), Some(&ignores)).unwrap();
        let names: Vec<_> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn mtime_is_second_aligned() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "a.txt", "x");
        let tree = walk(tmp.path(), None).unwrap();
        assert_eq!(tree.nodes[0].mtime.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn serialized_tree_round_trips() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "a.txt", "x");
        write_file(tmp.path(), "sub/b.txt", "y");
        let tree = walk(tmp.path(), None).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let parsed: FsNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.root_checksum(), tree.root_checksum());
    }

    #[test]
    fn unknown_json_fields_are_rejected() {
        let err = serde_json::from_str::<FsNode>(
            r#"{"name":"x","mode":0,"mtime":"1970-01-01T00:00:00Z","surprise":1}"#,
        );
        assert!(err.is_err());
    }
}
