//! Public mount/unmount entry points (spec §6), wiring the `WimFs` context,
//! the `fuser` kernel bridge, and the unmount handshake together.
//!
//! Grounded on `original_source/src/mount.c`'s `wimlib_mount` and
//! `wimlib_unmount` — `wimlib_mount` forks a daemon and calls `fuse_main`,
//! which blocks until the filesystem is unmounted; `mount` here mirrors that
//! by blocking the calling task (via `spawn_blocking`) for the whole mount
//! lifetime rather than returning once the session is merely established.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use tracing::{debug, warn};

use crate::codec::ArchiveCodec;
use crate::config::{MountConfig, StreamInterface, UnmountFlags};
use crate::error::MountError;
use crate::fuse_adapter::WimFsAdapter;
use crate::ops::WimFs;
use crate::staging::StagingStore;

/// A WIM archive opened by the caller's codec, ready to be mounted. Owns
/// nothing but the codec handle — archive parsing/opening is the codec's
/// concern (spec §1 "external collaborators"), not this crate's.
pub struct OpenArchive {
    codec: Arc<dyn ArchiveCodec>,
}

impl OpenArchive {
    pub fn new(codec: Arc<dyn ArchiveCodec>) -> Self {
        Self { codec }
    }
}

/// Flag bitmap accepted by [`mount`] (spec §6), mirroring
/// `WIMLIB_MOUNT_FLAG_*` from `original_source/src/mount.c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountFlags {
    pub read_write: bool,
    pub debug: bool,
    pub stream_interface: StreamInterface,
}

/// Mounts `archive`'s `image` at `mount_dir` and blocks until the kernel
/// session ends (spec §6: "hands control to the kernel bridge").
/// Unmounting happens out-of-process, via [`unmount`].
pub async fn mount(archive: OpenArchive, image: u32, mount_dir: &Path, flags: MountFlags) -> Result<(), MountError> {
    if !mount_dir.is_dir() {
        return Err(MountError::NotDir);
    }
    crate::handshake::claim_channel_names(mount_dir).await?;

    let config = MountConfig {
        read_write: flags.read_write,
        debug: flags.debug,
        stream_interface: flags.stream_interface,
        ..Default::default()
    };

    let staging_root = config.staging_root.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let staging = match StagingStore::create_under(&staging_root).await {
        Ok(staging) => staging,
        Err(_) => {
            crate::handshake::release_channel_names(mount_dir).await;
            return Err(MountError::Mkdir);
        }
    };

    let fs = Arc::new(WimFs::new(archive.codec, staging, config, image));
    let adapter = match WimFsAdapter::new(fs, mount_dir.to_path_buf()) {
        Ok(adapter) => adapter,
        Err(_) => {
            crate::handshake::release_channel_names(mount_dir).await;
            return Err(MountError::Fuse);
        }
    };

    let mut options = vec![MountOption::FSName("wimfs".to_string())];
    options.push(if flags.read_write { MountOption::RW } else { MountOption::RO });
    if flags.debug {
        debug!(mount_dir = %mount_dir.display(), "mounting with debug logging enabled");
    }

    let mount_dir_owned = mount_dir.to_path_buf();
    let result = tokio::task::spawn_blocking(move || fuser::mount2(adapter, &mount_dir_owned, &options)).await;
    match result {
        Ok(Ok(())) => Ok(()),
        _ => {
            // `destroy()` only unlinks the claim once a FUSE session actually
            // started; a session that never came up leaves it dangling.
            crate::handshake::release_channel_names(mount_dir).await;
            Err(MountError::Fuse)
        }
    }
}

/// Unmounts the filesystem at `mount_dir` (spec §6), performing the client
/// side of the unmount handshake: asks the kernel to tear the session down
/// via `fusermount -u`, then sends the commit decision and waits up to 600s
/// for the daemon's terminal status.
pub async fn unmount(mount_dir: &Path, flags: UnmountFlags) -> Result<(), MountError> {
    let decision = crate::handshake::CommitDecision { commit: flags.commit, check_integrity: flags.check_integrity };

    let status = tokio::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_dir)
        .status()
        .await
        .map_err(|_| MountError::Fusermount)?;
    if !status.success() {
        return Err(MountError::Fusermount);
    }

    match crate::handshake::client_round_trip(mount_dir, decision, Duration::from_millis(600_000)).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(mount_dir = %mount_dir.display(), "daemon reported a failed commit");
            Err(MountError::Write)
        }
        Err(err) => Err(err),
    }
}
