//! Patch archive decoder: applies a gzip tarball onto a directory.

use std::fs::{self, FileTimes, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::constants::WHITEOUT_DELETE_SUFFIX;
use crate::error::{Error, Result};

/// Applies a gzip-compressed tar patch to `dir`, in entry order.
///
/// Directory entries are created idempotently; whiteout entries remove the
/// stripped path recursively; regular entries are written, chmod'ed
/// explicitly (the umask may have interfered with the create mode), and get
/// the entry's mtime. Any other entry type fails the apply.
///
/// Returns the entry names in application order so callers can log the set
/// of changes.
pub fn apply_patch<R: Read>(dir: &Path, reader: R) -> Result<Vec<String>> {
    let mut touched = Vec::new();
    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| Error::io("failed to initialize tar reader", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io("error reading tar header", e))?;
        let name = entry
            .path()
            .map_err(|e| Error::io("error reading tar entry path", e))?
            .to_string_lossy()
            .into_owned();
        touched.push(name.clone());
        let target = dir.join(&name);

        match entry.header().entry_type() {
            EntryType::Directory => {
                let mode = entry.header().mode().unwrap_or(0o755);
                if !target.exists() {
                    fs::create_dir_all(&target).map_err(|e| {
                        Error::io(format!("failed to mkdir for tar dir entry {name}"), e)
                    })?;
                    fs::set_permissions(&target, Permissions::from_mode(mode)).map_err(
                        |e| Error::io(format!("failed to chmod tar dir entry {name}"), e),
                    )?;
                }
            }
            EntryType::Regular => {
                if let Some(stripped) = name.strip_suffix(WHITEOUT_DELETE_SUFFIX) {
                    remove_recursively(&dir.join(stripped)).map_err(|e| {
                        Error::io(format!("failed to realize delete whiteout file {name}"), e)
                    })?;
                    continue;
                }
                write_regular(&target, &name, &mut entry)?;
            }
            other => {
                return Err(Error::InvalidArchive(format!(
                    "found non-regular file entry in tar (type: {other:?}) file: {name}"
                )));
            }
        }
    }
    Ok(touched)
}

fn write_regular<R: Read>(target: &Path, name: &str, entry: &mut tar::Entry<'_, R>) -> Result<()> {
    let mode = entry.header().mode().unwrap_or(0o644);
    let mtime = UNIX_EPOCH + Duration::from_secs(entry.header().mtime().unwrap_or(0));

    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(target)
        .map_err(|e| Error::io(format!("failed to create file for tar entry {name}"), e))?;
    io::copy(entry, &mut f)
        .map_err(|e| Error::io(format!("failed to copy file contents for tar entry {name}"), e))?;
    f.set_permissions(Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("failed to chmod file for tar entry {name}"), e))?;
    f.set_times(FileTimes::new().set_accessed(mtime).set_modified(mtime))
        .map_err(|e| {
            Error::io(format!("failed to change times of copied file for tar entry {name}"), e)
        })?;
    Ok(())
}

/// Removes `path` whether it is a file or a directory tree; a missing path
/// is not an error.
fn remove_recursively(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::patch_archive;
    use crate::fsdiff::{fs_diff, DiffOp};
    use crate::fsnode::walk;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
    }

    #[test]
    fn empty_archive_is_a_noop() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let bytes = patch_archive(src.path(), &[], None).unwrap();
        let touched = apply_patch(dst.path(), &bytes[..]).unwrap();
        assert!(touched.is_empty());
    }

    #[test]
    fn file_entry_replaces_target_file() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(src.path(), "b.txt", "new contents");
        write_file(dst.path(), "b.txt", "old");
        let bytes = patch_archive(src.path(), &[DiffOp::add("b.txt")], None).unwrap();
        let touched = apply_patch(dst.path(), &bytes[..]).unwrap();
        assert_eq!(touched, vec!["b.txt"]);
        assert_eq!(fs::read_to_string(dst.path().join("b.txt")).unwrap(), "new contents");
    }

    #[test]
    fn whiteout_removes_directory_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(dst.path(), "subdir/f1", "x");
        write_file(dst.path(), "subdir/nested/f2", "y");
        let bytes = patch_archive(src.path(), &[DiffOp::del("subdir")], None).unwrap();
        apply_patch(dst.path(), &bytes[..]).unwrap();
        assert!(!dst.path().join("subdir").exists());
    }

    #[test]
    fn whiteout_for_missing_path_is_fine() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let bytes = patch_archive(src.path(), &[DiffOp::del("never-there")], None).unwrap();
        apply_patch(dst.path(), &bytes[..]).unwrap();
    }

    #[test]
    fn dir_to_file_replacement_applies_in_order() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(src.path(), "subdir", "now a file");
        write_file(dst.path(), "subdir/f1", "x");
        let ops = [DiffOp::del("subdir"), DiffOp::add("subdir")];
        let bytes = patch_archive(src.path(), &ops, None).unwrap();
        apply_patch(dst.path(), &bytes[..]).unwrap();
        assert_eq!(
            fs::read_to_string(dst.path().join("subdir")).unwrap(),
            "now a file"
        );
    }

    #[test]
    fn diff_archive_apply_converges_fingerprints() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        write_file(local.path(), "a.txt", "v2 with longer contents");
        write_file(local.path(), "sub/new.txt", "fresh");
        write_file(remote.path(), "a.txt", "v1");
        write_file(remote.path(), "stale/old.txt", "gone");

        let l = walk(local.path(), None).unwrap();
        let r = walk(remote.path(), None).unwrap();
        let ops = fs_diff(&l, &r);
        assert!(!ops.is_empty());

        let bytes = patch_archive(local.path(), &ops, None).unwrap();
        apply_patch(remote.path(), &bytes[..]).unwrap();

        let l2 = walk(local.path(), None).unwrap();
        let r2 = walk(remote.path(), None).unwrap();
        assert_eq!(l2.root_checksum(), r2.root_checksum());
        assert!(fs_diff(&l2, &r2).is_empty());
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(src.path(), "sub/f.txt", "data");
        let bytes = patch_archive(src.path(), &[DiffOp::add("sub")], None).unwrap();
        apply_patch(dst.path(), &bytes[..]).unwrap();
        apply_patch(dst.path(), &bytes[..]).unwrap();
        let s = walk(src.path(), None).unwrap();
        let d = walk(dst.path(), None).unwrap();
        assert_eq!(s.root_checksum(), d.root_checksum());
    }
}
