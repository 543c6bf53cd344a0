//! Local tree walking and patch uploads.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use rundev_common::archive::patch_archive;
use rundev_common::constants::{
    HDR_CHECKSUM, HDR_CLIENT_SECRET, HDR_PATCH_PRECONDITION_SUM, MIME_PATCH,
};
use rundev_common::fsdiff::fs_diff;
use rundev_common::{walk, FileIgnores, FsNode};

/// Sync configuration for the local side.
#[derive(Debug, Clone)]
pub struct SyncOpts {
    /// Directory the developer is editing.
    pub local_dir: PathBuf,
    /// Base URL of the remote daemon, e.g. `http://localhost:8888`.
    pub remote_url: String,
    /// Sent with every patch; the daemon may require it.
    pub client_secret: String,
    pub ignores: Option<FileIgnores>,
}

/// Walks the local tree and uploads patches when the remote falls behind.
pub struct Syncer {
    opts: SyncOpts,
    client: reqwest::Client,
}

impl Syncer {
    pub fn new(opts: SyncOpts) -> Self {
        Self {
            opts,
            client: reqwest::Client::new(),
        }
    }

    pub fn opts(&self) -> &SyncOpts {
        &self.opts
    }

    /// Fresh walk of the local tree.
    pub fn walk(&self) -> rundev_common::Result<FsNode> {
        walk(&self.opts.local_dir, self.opts.ignores.as_ref())
    }

    /// Fresh root fingerprint of the local tree.
    pub fn checksum(&self) -> rundev_common::Result<u64> {
        Ok(self.walk()?.root_checksum())
    }

    /// Computes and uploads a patch bringing the remote from `remote_fs` to
    /// the current local tree, preconditioned on `remote_checksum`.
    ///
    /// The local tree is walked again here: time has passed since the
    /// mismatch response and files may have changed underneath us.
    pub async fn upload_patch(&self, remote_fs: &FsNode, remote_checksum: &str) -> Result<()> {
        let local_fs = self.walk().context("failed to walk the local fs")?;
        let local_checksum = local_fs.root_checksum();
        info!(local = local_checksum, remote = %remote_checksum, "checksum mismatch");

        let diff = fs_diff(&local_fs, remote_fs);
        info!(ops = diff.len(), "diff operations");
        for op in &diff {
            debug!("  {op}");
        }

        let tarball = patch_archive(&self.opts.local_dir, &diff, self.opts.ignores.as_ref())
            .context("failed to build patch archive")?;
        info!(bytes = tarball.len(), "diff tarball");

        let url = format!("{}/rundevd/patch", self.opts.remote_url);
        let resp = self
            .client
            .patch(&url)
            .header(reqwest::header::CONTENT_TYPE, MIME_PATCH)
            .header(HDR_CLIENT_SECRET, &self.opts.client_secret)
            .header(HDR_PATCH_PRECONDITION_SUM, remote_checksum)
            .header(HDR_CHECKSUM, local_checksum.to_string())
            .body(tarball)
            .send()
            .await
            .context("error making patch request")?;

        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED {
            let new_remote = resp
                .headers()
                .get(HDR_CHECKSUM)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "unexpected patch response status={status} (was expecting http 202) \
                 (new remote checksum: {new_remote}, old remote checksum: {remote_checksum}, \
                 local: {local_checksum}). response body: {body}"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn syncer_for(dir: &TempDir) -> Syncer {
        Syncer::new(SyncOpts {
            local_dir: dir.path().to_path_buf(),
            remote_url: "http://localhost:1".into(),
            client_secret: String::new(),
            ignores: None,
        })
    }

    #[test]
    fn checksum_tracks_local_edits() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f.txt"), "v1").unwrap();
        let syncer = syncer_for(&tmp);
        let before = syncer.checksum().unwrap();
        fs::write(tmp.path().join("f.txt"), "v2 with more bytes").unwrap();
        assert_ne!(syncer.checksum().unwrap(), before);
    }

    #[test]
    fn checksum_fails_on_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let syncer = Syncer::new(SyncOpts {
            local_dir: tmp.path().join("gone"),
            remote_url: "http://localhost:1".into(),
            client_secret: String::new(),
            ignores: None,
        });
        assert!(syncer.checksum().is_err());
    }
}
