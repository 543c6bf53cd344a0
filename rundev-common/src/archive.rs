//! Patch archive encoder: an ordered edit script becomes a gzip tarball.
//!
//! Deletions are encoded as zero-byte regular entries whose name carries the
//! whiteout suffix. Added directories are expanded recursively, the
//! directory itself first. Size and mtime normalization mirrors the walk
//! (directories zero-sized, mtimes whole seconds) so a
//! walk-compare-apply-walk cycle converges.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use crate::constants::WHITEOUT_DELETE_SUFFIX;
use crate::error::{Error, Result};
use crate::fsdiff::{DiffKind, DiffOp};
use crate::fsnode::{relative_slash_path, truncate_mtime};
use crate::ignore::{is_ignored, FileIgnores};

const PERM_MASK: u32 = 0o7777;
const WHITEOUT_MODE: u32 = 0o444;

/// One entry destined for the tarball.
#[derive(Debug)]
enum ArchiveEntry {
    /// Deletion tombstone; carries only the extract path.
    Whiteout { extract_path: String },
    /// Regular file copied from disk.
    File {
        full_path: PathBuf,
        extract_path: String,
        meta: fs::Metadata,
    },
    /// Directory placeholder (size forced to zero).
    Dir { extract_path: String, meta: fs::Metadata },
}

/// Encodes `ops` against `base_dir` into a gzip-compressed tar.
///
/// Returns the archive bytes; the caller reads the byte count off the
/// buffer. Symbolic links abort the encode with [`Error::Unsupported`].
pub fn patch_archive(
    base_dir: &Path,
    ops: &[DiffOp],
    ignores: Option<&FileIgnores>,
) -> Result<Vec<u8>> {
    let entries = normalize_entries(base_dir, ops, ignores)?;

    let gz = GzEncoder::new(Vec::new(), Compression::fast());
    let mut tar = Builder::new(gz);
    for entry in &entries {
        append_entry(&mut tar, entry)?;
    }
    let gz = tar
        .into_inner()
        .map_err(|e| Error::io("failed to finalize tarball writer", e))?;
    gz.finish()
        .map_err(|e| Error::io("failed to finalize gzip writer", e))
}

fn append_entry(tar: &mut Builder<GzEncoder<Vec<u8>>>, entry: &ArchiveEntry) -> Result<()> {
    let mut header = Header::new_gnu();
    match entry {
        ArchiveEntry::Whiteout { extract_path } => {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(WHITEOUT_MODE);
            header.set_size(0);
            header.set_mtime(0);
            tar.append_data(&mut header, extract_path, io::empty())
                .map_err(|e| Error::io(format!("failed to append whiteout {extract_path}"), e))
        }
        ArchiveEntry::File {
            full_path,
            extract_path,
            meta,
        } => {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(meta.mode() & PERM_MASK);
            header.set_size(meta.len());
            header.set_mtime(entry_mtime(meta));
            let f = File::open(full_path).map_err(|e| {
                Error::io(format!("failed to open {} for tar-ing", full_path.display()), e)
            })?;
            tar.append_data(&mut header, extract_path, f)
                .map_err(|e| Error::io(format!("failed to copy {extract_path} into tar"), e))
        }
        ArchiveEntry::Dir { extract_path, meta } => {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(meta.mode() & PERM_MASK);
            header.set_size(0);
            header.set_mtime(0);
            tar.append_data(&mut header, extract_path, io::empty())
                .map_err(|e| Error::io(format!("failed to append dir {extract_path}"), e))
        }
    }
}

fn entry_mtime(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .map(|t| truncate_mtime(t).timestamp().max(0) as u64)
        .unwrap_or(0)
}

/// Expands the op list into concrete tar entries: whiteouts for deletions
/// and recursive directory listings for added directories, filtered by the
/// ignore rules.
fn normalize_entries(
    base_dir: &Path,
    ops: &[DiffOp],
    ignores: Option<&FileIgnores>,
) -> Result<Vec<ArchiveEntry>> {
    let mut out = Vec::new();
    for op in ops {
        let full_path = base_dir.join(&op.path);
        match op.kind {
            DiffKind::Del => out.push(ArchiveEntry::Whiteout {
                extract_path: format!("{}{}", op.path, WHITEOUT_DELETE_SUFFIX),
            }),
            DiffKind::Add => {
                let meta = fs::symlink_metadata(&full_path).map_err(|e| {
                    Error::io(format!("failed to stat {} for tar-ing", full_path.display()), e)
                })?;
                if is_ignored(ignores, &op.path) {
                    continue;
                }
                reject_symlink(&full_path, &meta)?;
                if !meta.is_dir() {
                    out.push(ArchiveEntry::File {
                        full_path,
                        extract_path: op.path.clone(),
                        meta,
                    });
                } else {
                    expand_dir(base_dir, &full_path, ignores, &mut out)?;
                }
            }
        }
    }
    Ok(out)
}

/// Walks `dir` recursively, emitting the directory itself followed by its
/// children in sorted order.
fn expand_dir(
    base_dir: &Path,
    dir: &Path,
    ignores: Option<&FileIgnores>,
    out: &mut Vec<ArchiveEntry>,
) -> Result<()> {
    let meta = fs::symlink_metadata(dir)
        .map_err(|e| Error::io(format!("failed to read info for dir {}", dir.display()), e))?;
    out.push(ArchiveEntry::Dir {
        extract_path: relative_slash_path(base_dir, dir),
        meta,
    });

    let mut children: Vec<_> = fs::read_dir(dir)
        .map_err(|e| Error::io(format!("failed to read dir {}", dir.display()), e))?
        .collect::<io::Result<_>>()
        .map_err(|e| Error::io(format!("failed to read dir {}", dir.display()), e))?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let child_path = child.path();
        let rel = relative_slash_path(base_dir, &child_path);
        if is_ignored(ignores, &rel) {
            continue;
        }
        let meta = fs::symlink_metadata(&child_path)
            .map_err(|e| Error::io(format!("failed to stat {}", child_path.display()), e))?;
        reject_symlink(&child_path, &meta)?;
        if meta.is_dir() {
            expand_dir(base_dir, &child_path, ignores, out)?;
        } else {
            out.push(ArchiveEntry::File {
                full_path: child_path,
                extract_path: rel,
                meta,
            });
        }
    }
    Ok(())
}

fn reject_symlink(path: &Path, meta: &fs::Metadata) -> Result<()> {
    if meta.file_type().is_symlink() {
        return Err(Error::Unsupported(format!(
            "adding symlinks currently not supported, file: {}",
            path.display()
        )));
    }
    Ok(())
}
