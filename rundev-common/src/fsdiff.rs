//! Ordered edit script between two filesystem trees.

use serde::{Deserialize, Serialize};

use crate::fsnode::FsNode;

/// Whether a path must be uploaded or removed on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Add,
    Del,
}

/// One element of the edit script transforming the remote tree into the
/// local tree. `path` is forward-slash separated, relative to the sync
/// directory root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOp {
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub path: String,
}

impl DiffOp {
    pub fn add(path: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Add,
            path: path.into(),
        }
    }

    pub fn del(path: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Del,
            path: path.into(),
        }
    }
}

impl std::fmt::Display for DiffOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let k = match self.kind {
            DiffKind::Add => "A",
            DiffKind::Del => "D",
        };
        write!(f, "{} {}", k, self.path)
    }
}

/// Computes the operations that make `remote` look like `local`.
///
/// A two-pointer merge over the sorted children at each level. A
/// file/directory flip at the same path yields `Del` then `Add` in that
/// order, which is also the order the archive encoder relies on.
pub fn fs_diff(local: &FsNode, remote: &FsNode) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    diff_level(local, remote, ".", &mut ops);
    ops
}

fn diff_level(local: &FsNode, remote: &FsNode, base: &str, ops: &mut Vec<DiffOp>) {
    let mut ln = local.nodes.as_slice();
    let mut rn = remote.nodes.as_slice();

    while let (Some(l), Some(r)) = (ln.first(), rn.first()) {
        if l.name < r.name {
            // entry missing on the remote
            ops.push(DiffOp::add(join_path(base, &l.name)));
            ln = &ln[1..];
        } else if l.name > r.name {
            // entry no longer exists locally
            ops.push(DiffOp::del(join_path(base, &r.name)));
            rn = &rn[1..];
        } else {
            if l.is_dir() != r.is_dir() {
                let path = join_path(base, &l.name);
                ops.push(DiffOp::del(path.clone()));
                ops.push(DiffOp::add(path));
            } else if l.checksum() != r.checksum() {
                if !l.is_dir() {
                    // no sub-file delta: re-upload the whole file
                    ops.push(DiffOp::add(join_path(base, &l.name)));
                } else {
                    diff_level(l, r, &join_path(base, &l.name), ops);
                }
            }
            ln = &ln[1..];
            rn = &rn[1..];
        }
    }
    for l in ln {
        ops.push(DiffOp::add(join_path(base, &l.name)));
    }
    for r in rn {
        ops.push(DiffOp::del(join_path(base, &r.name)));
    }
}

/// Joins `base` and `name` with a forward slash, dropping the `.` root so
/// the root name never appears as a path component.
fn join_path(base: &str, name: &str) -> String {
    if base == "." || base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}
