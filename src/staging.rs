//! Staging Store: the private temp directory holding materialized resource
//! copies (spec §4.1).
//!
//! Grounded on `original_source/src/mount.c`'s `create_staging_file`,
//! `make_staging_dir`, and `delete_staging_dir`.

use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{WimFsError, WimFsResult};

const STAGING_FILE_NAME_LEN: usize = 20;
const STAGING_DIR_SUFFIX_LEN: usize = 10;
const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_alnum(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALNUM[rng.gen_range(0..ALNUM.len())] as char).collect()
}

/// Private temp directory holding materialized resource copies.
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    /// Creates the staging directory under `cwd` with basename
    /// `wimlib-staging-<10 alnum>` and mode 0700 (spec §4.1).
    pub async fn create_under(cwd: &Path) -> WimFsResult<Self> {
        let dir = cwd.join(format!("wimlib-staging-{}", random_alnum(STAGING_DIR_SUFFIX_LEN)));
        tokio::fs::create_dir(&dir).await.map_err(WimFsError::from)?;
        set_mode(&dir, 0o700).await?;
        debug!(dir = %dir.display(), "created staging directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Creates a new zero-length staging file under a randomly generated
    /// 20-character alphanumeric basename, verifying non-collision before
    /// opening with `CREATE|TRUNC`, mode 0600 (spec §4.1).
    pub async fn create(&self) -> WimFsResult<(PathBuf, File)> {
        loop {
            let candidate = self.dir.join(random_alnum(STAGING_FILE_NAME_LEN));
            if tokio::fs::metadata(&candidate).await.is_ok() {
                continue;
            }
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
                .map_err(WimFsError::from)?;
            set_mode(&candidate, 0o600).await?;
            return Ok((candidate, file));
        }
    }

    /// Recursively removes the staging directory tree. Returns the first
    /// error encountered rather than aborting on the first failed entry,
    /// mirroring `nftw(..., FTW_DEPTH)`'s best-effort depth-first removal
    /// (spec §4.1, §4.5 step 5). Takes `&self` rather than consuming the
    /// store since the owning mount context is shared behind an `Arc` and
    /// torn down shortly after commit regardless.
    pub async fn destroy_all(&self) -> WimFsResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "failed to remove staging directory");
                Err(WimFsError::from(err))
            }
        }
    }
}

#[cfg(target_os = "linux")]
async fn set_mode(path: &Path, mode: u32) -> WimFsResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode);
    tokio::fs::set_permissions(path, permissions).await.map_err(WimFsError::from)
}

#[cfg(not(target_os = "linux"))]
async fn set_mode(_path: &Path, _mode: u32) -> WimFsResult<()> {
    Ok(())
}

/// Opens a raw kernel fd against a staging file (invariant I3: every FH
/// whose LTE is staged holds one). Used both for a freshly allocated handle
/// opened against an already-staged LTE and, in `virtualizer::materialize`,
/// to backfill fds for handles carried over when an LTE becomes staged.
pub fn open_fd(path: &Path, write: bool) -> WimFsResult<RawFd> {
    let file = std::fs::OpenOptions::new().read(true).write(write).open(path).map_err(WimFsError::from)?;
    Ok(file.into_raw_fd())
}

/// Writes `data` to a freshly created staging file's write end and leaves
/// the open handle positioned at EOF — used by the Resource Virtualizer
/// to extract archive bytes into the new staging file (spec §4.3 step 2).
pub async fn write_all(file: &mut File, data: &[u8]) -> WimFsResult<()> {
    file.write_all(data).await.map_err(WimFsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_destroy_round_trip() {
        let cwd = tempfile::tempdir().unwrap();
        let store = StagingStore::create_under(cwd.path()).await.unwrap();
        let (path, mut file) = store.create().await.unwrap();
        write_all(&mut file, b"hello").await.unwrap();
        assert!(path.exists());
        store.destroy_all().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn create_generates_distinct_names() {
        let cwd = tempfile::tempdir().unwrap();
        let store = StagingStore::create_under(cwd.path()).await.unwrap();
        let (a, _) = store.create().await.unwrap();
        let (b, _) = store.create().await.unwrap();
        assert_ne!(a, b);
    }
}
