//! FS Operation Handlers (spec §4.4): one async method per filesystem
//! primitive, each mapping an inode to a tree + resource operation and
//! calling into the Resource Virtualizer when a write impinges on a
//! shared resource.
//!
//! Grounded on `original_source/src/mount.c`'s `wimfs_*` callbacks and on
//! `examples/shadow_fs/fs/mod.rs`'s `impl vfs::Vfs for ShadowFS` shape —
//! one inherent async method per primitive on a single context struct,
//! rather than the teacher's per-procedure wire-message split (NFSv3's
//! `Vfs` trait mirrors RFC 1813 procedure numbers; there is no equivalent
//! wire enumeration here, so the methods are grouped in one module).
//!
//! `WimFs` is the "per-mount context object" design note (spec §9) calls
//! for: every handler takes `&self` and reaches the tree, lookup table,
//! staging store, and codec through it instead of process-globals.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::ArchiveCodec;
use crate::config::{MountConfig, StreamInterface};
use crate::error::{WimFsError, WimFsResult};
use crate::lookup_table::{ContentHash, FileHandle, LookupTable};
use crate::staging::StagingStore;
use crate::tree::{DirEntryId, HardLinkGroupId, HashSlot, Tree};
use crate::virtualizer;

/// Windows `IO_REPARSE_TAG_SYMLINK`, the only reparse tag this crate
/// produces (spec §4.4 `symlink`).
pub const REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// High bit of a FUSE `ino` marking it as an alternate-data-stream pseudo
/// inode rather than a DE's own identity (spec §9 "Hash-slot uniformity";
/// ADS entries need a FUSE-visible identity distinct from their owning DE
/// so `getattr`/`open`/`read` on the stream path resolve to the ADS's hash
/// slot instead of the primary one).
const ADS_INO_BIT: u64 = 1 << 63;

fn encode_ads_ino(dentry: DirEntryId, ads_index: usize) -> u64 {
    ADS_INO_BIT | (dentry.0 << 8) | (ads_index as u64 + 1)
}

fn decode_ino(ino: u64) -> (DirEntryId, HashSlot) {
    if ino & ADS_INO_BIT != 0 {
        let rest = ino & !ADS_INO_BIT;
        let dentry = DirEntryId(rest >> 8);
        let ads_index = (rest & 0xFF) as usize - 1;
        (dentry, HashSlot::Ads(ads_index))
    } else {
        (DirEntryId(ino), HashSlot::Primary)
    }
}

/// Splits `name:stream` syntax for the Windows stream interface
/// (spec §4.4 `lookup`). Returns `None` for plain names.
fn split_stream_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(':').filter(|(base, stream)| !base.is_empty() && !stream.is_empty())
}

/// Attributes synthesized for `getattr`/`fgetattr` (spec §4.4), expressed
/// independently of any particular kernel bridge's stat representation so
/// this module does not depend on `fuser`.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub nlink: u32,
    pub atime_ms: i64,
    pub mtime_ms: i64,
}

/// A directory entry as seen by `readdir` (spec §4.4).
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: String,
    pub ino: u64,
    pub is_dir: bool,
}

/// How `utimens` should update one timestamp (spec §4.4): either leave it
/// alone, set it to "now", or set it to a caller-provided value.
#[derive(Debug, Clone, Copy)]
pub enum TimeUpdate {
    Unchanged,
    Now,
    SetMillis(i64),
}

const WINDOWS_TO_UNIX_EPOCH_SECONDS: i64 = 11_644_473_600;

fn windows_epoch_millis_now() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as i64 + WINDOWS_TO_UNIX_EPOCH_SECONDS * 1000
}

/// The per-mount context object (spec §9): owns the tree, the lookup
/// table, the staging store, and the codec, and is threaded through every
/// handler instead of process-globals.
pub struct WimFs {
    tree: Mutex<Tree>,
    lookup_table: LookupTable,
    staging: StagingStore,
    codec: Arc<dyn ArchiveCodec>,
    config: MountConfig,
    image_index: u32,
    next_fh: AtomicU64,
    /// fh -> current LTE hash. The hash side of this map is rewritten
    /// whenever materialize moves a handle to a new LTE (reuse or split);
    /// the fh itself is stable for the handle's entire lifetime.
    open_files: Mutex<HashMap<u64, ContentHash>>,
}

impl WimFs {
    pub fn new(codec: Arc<dyn ArchiveCodec>, staging: StagingStore, config: MountConfig, image_index: u32) -> Self {
        Self {
            tree: Mutex::new(Tree::new()),
            lookup_table: LookupTable::new(),
            staging,
            codec,
            config,
            image_index,
            next_fh: AtomicU64::new(1),
            open_files: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_ino(&self) -> u64 {
        crate::tree::ROOT_ID.0
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Exposed for the Commit Engine and for archive-load / test seeding,
    /// both of which need direct tree/lookup-table access the per-handler
    /// API intentionally doesn't provide.
    pub fn tree(&self) -> &Mutex<Tree> {
        &self.tree
    }

    pub fn lookup_table(&self) -> &LookupTable {
        &self.lookup_table
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    pub fn codec(&self) -> &dyn ArchiveCodec {
        self.codec.as_ref()
    }

    async fn inc_refcnt(&self, hash: ContentHash) {
        if hash.is_zero() {
            return;
        }
        self.lookup_table.with_mut(&hash, |lte| lte.refcnt += 1).await;
    }

    /// Decrements an LTE's refcount, destroying it (and its staging file,
    /// if any) once both refcnt and open-handle count reach zero
    /// (invariant I2).
    async fn dec_refcnt(&self, hash: ContentHash) {
        if hash.is_zero() {
            return;
        }
        let destroy = self
            .lookup_table
            .with_mut(&hash, |lte| {
                lte.refcnt = lte.refcnt.saturating_sub(1);
                lte.refcnt == 0 && lte.descriptors.num_opened() == 0
            })
            .await
            .unwrap_or(false);
        if destroy {
            self.destroy_lte(hash).await;
        }
    }

    async fn destroy_lte(&self, hash: ContentHash) {
        if let Some(lte) = self.lookup_table.remove(&hash).await {
            if let Some(path) = lte.staging_file_name {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove orphaned staging file");
                }
            }
        }
    }

    /// Rewrites every open fh currently pointing at the LTE installed
    /// under `new_hash` to reflect that hash, after a `materialize` call
    /// installs it (spec §4.3 step 5, invariant I5).
    async fn remap_after_materialize(&self, new_hash: ContentHash) {
        let ids = self
            .lookup_table
            .with_mut(&new_hash, |lte| lte.descriptors.ids())
            .await
            .unwrap_or_default();
        if ids.is_empty() {
            return;
        }
        let mut open_files = self.open_files.lock().await;
        for id in ids {
            open_files.insert(id, new_hash);
        }
    }

    async fn fd_for(&self, fh: u64, hash: &ContentHash) -> WimFsResult<RawFd> {
        self.lookup_table
            .with_mut(hash, |lte| {
                let slot = lte.descriptors.find_by_id(fh)?;
                lte.descriptors.get(slot)?.kernel_fd
            })
            .await
            .flatten()
            .ok_or(WimFsError::Io)
    }

    async fn attr_for(&self, dentry: DirEntryId, slot: HashSlot, ino: u64) -> WimFsResult<Attr> {
        let (hash, is_dir, is_symlink, nlink, atime_ms, mtime_ms) = {
            let tree = self.tree.lock().await;
            let entry = tree.get(dentry).ok_or(WimFsError::NoEnt)?;
            let hash = entry.hash_slot(slot);
            let is_dir = slot == HashSlot::Primary && entry.attributes.directory;
            let is_symlink = slot == HashSlot::Primary && entry.attributes.reparse_point;
            let nlink = if slot == HashSlot::Primary {
                tree.hard_link_group_size(entry.hard_link_group).max(1) as u32
            } else {
                1
            };
            (hash, is_dir, is_symlink, nlink, entry.atime_ms, entry.mtime_ms)
        };
        let size = if hash.is_zero() {
            0
        } else {
            self.lookup_table.with_mut(&hash, |lte| lte.original_size).await.unwrap_or(0)
        };
        Ok(Attr { ino, size, is_dir, is_symlink, nlink, atime_ms, mtime_ms })
    }

    /// spec §4.4 `lookup`: resolves a name within a directory, or an ADS
    /// suffix of one, to an ino + attributes.
    pub async fn lookup(&self, parent_ino: u64, name: &str) -> WimFsResult<(u64, Attr)> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }

        if self.config.stream_interface == StreamInterface::Windows {
            if let Some((base, stream)) = split_stream_name(name) {
                let mut tree = self.tree.lock().await;
                let base_dentry = tree.lookup_child(parent_dentry, base).ok_or(WimFsError::NoEnt)?;
                let ads_index = {
                    let entry = tree.get(base_dentry).ok_or(WimFsError::NoEnt)?;
                    entry.ads.iter().position(|ads| ads.name == stream).ok_or(WimFsError::NoEnt)?
                };
                tree.lookup_ref(base_dentry);
                let ino = encode_ads_ino(base_dentry, ads_index);
                drop(tree);
                let attr = self.attr_for(base_dentry, HashSlot::Ads(ads_index), ino).await?;
                return Ok((ino, attr));
            }
        }

        let mut tree = self.tree.lock().await;
        let dentry = tree.lookup_child(parent_dentry, name).ok_or(WimFsError::NoEnt)?;
        tree.lookup_ref(dentry);
        drop(tree);
        let ino = dentry.0;
        let attr = self.attr_for(dentry, HashSlot::Primary, ino).await?;
        Ok((ino, attr))
    }

    /// spec §4.4 `getattr`/`fgetattr`.
    pub async fn getattr(&self, ino: u64) -> WimFsResult<Attr> {
        let (dentry, slot) = decode_ino(ino);
        self.attr_for(dentry, slot, ino).await
    }

    /// spec §4.4 Supplement `forget`: kernel `forget(nlookup)`. An ADS ino
    /// decodes to its base DE (`decode_ino`); `lookup` takes its reference
    /// there too, so `forget` must decrement the same DE regardless of slot.
    pub async fn forget(&self, ino: u64, nlookup: u64) {
        let (dentry, _slot) = decode_ino(ino);
        let mut tree = self.tree.lock().await;
        tree.forget(dentry, nlookup);
    }

    /// spec §4.4 `open`. Returns fh `0` for the null-handle case (an
    /// absent resource opened read-only): `read`/`release` become no-ops
    /// against it.
    pub async fn open(&self, ino: u64, write_requested: bool) -> WimFsResult<u64> {
        let (dentry, slot) = decode_ino(ino);
        let hash = {
            let tree = self.tree.lock().await;
            tree.get(dentry).ok_or(WimFsError::NoEnt)?.hash_slot(slot)
        };

        if hash.is_zero() && !self.config.read_write {
            let mut tree = self.tree.lock().await;
            tree.open(dentry)?;
            return Ok(0);
        }

        let already_staged = if hash.is_zero() {
            false
        } else {
            self.lookup_table.with_mut(&hash, |lte| lte.is_staged()).await.unwrap_or(false)
        };

        let hash = if self.config.read_write || (write_requested && !already_staged) {
            let original_size = if hash.is_zero() {
                0
            } else {
                self.lookup_table.with_mut(&hash, |lte| lte.original_size).await.unwrap_or(0)
            };
            let mut tree = self.tree.lock().await;
            let new_hash = virtualizer::materialize(
                &mut tree,
                &self.lookup_table,
                &self.staging,
                self.codec.as_ref(),
                dentry,
                slot,
                original_size,
            )
            .await?;
            drop(tree);
            self.remap_after_materialize(new_hash).await;
            new_hash
        } else {
            hash
        };

        {
            let mut tree = self.tree.lock().await;
            tree.open(dentry)?;
        }

        if hash.is_zero() {
            return Ok(0);
        }

        let is_staged = self.lookup_table.with_mut(&hash, |lte| lte.is_staged()).await.unwrap_or(false);
        let staging_path = if is_staged {
            self.lookup_table.with_mut(&hash, |lte| lte.staging_file_name.clone()).await.flatten()
        } else {
            None
        };
        let kernel_fd = match staging_path {
            Some(path) => Some(crate::staging::open_fd(&path, write_requested)?),
            None => None,
        };

        let hard_link_group = {
            let tree = self.tree.lock().await;
            tree.get(dentry).map(|entry| entry.hard_link_group).unwrap_or(HardLinkGroupId(0))
        };

        let id = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = FileHandle { id, slot: 0, dentry: Some(dentry), hard_link_group, kernel_fd, writable: write_requested };
        let slot_result = self
            .lookup_table
            .with_mut(&hash, |lte| lte.descriptors.allocate(handle))
            .await
            .ok_or(WimFsError::Io)?;
        slot_result?;

        self.open_files.lock().await.insert(id, hash);
        debug!(ino, fh = id, "opened");
        Ok(id)
    }

    /// spec §4.4 `read`.
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> WimFsResult<Vec<u8>> {
        if fh == 0 {
            return Ok(Vec::new());
        }
        let hash = *self.open_files.lock().await.get(&fh).ok_or(WimFsError::Io)?;
        let is_staged = self.lookup_table.with_mut(&hash, |lte| lte.is_staged()).await.unwrap_or(false);
        if is_staged {
            let fd = self.fd_for(fh, &hash).await?;
            read_at(fd, offset, size)
        } else {
            let original_size = self.lookup_table.with_mut(&hash, |lte| lte.original_size).await.unwrap_or(0);
            if offset > original_size {
                return Err(WimFsError::Overflow);
            }
            let len = (size as u64).min(original_size - offset);
            self.codec.read_resource(&hash, offset, len).await
        }
    }

    /// spec §4.4 `write`: always against a staged fd.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> WimFsResult<u32> {
        if fh == 0 {
            return Err(WimFsError::Perm);
        }
        let hash = *self.open_files.lock().await.get(&fh).ok_or(WimFsError::Io)?;
        let fd = self.fd_for(fh, &hash).await?;
        let written = write_at(fd, offset, data)?;
        let end = offset + written as u64;
        self.lookup_table
            .with_mut(&hash, |lte| {
                if end > lte.original_size {
                    lte.original_size = end;
                }
            })
            .await;
        Ok(written as u32)
    }

    /// spec §4.4 `truncate`/`ftruncate`.
    pub async fn truncate(&self, ino: u64, size: u64) -> WimFsResult<()> {
        let (dentry, slot) = decode_ino(ino);
        let hash = {
            let tree = self.tree.lock().await;
            tree.get(dentry).ok_or(WimFsError::NoEnt)?.hash_slot(slot)
        };
        if hash.is_zero() {
            return Ok(());
        }
        let is_staged = self.lookup_table.with_mut(&hash, |lte| lte.is_staged()).await.unwrap_or(false);
        if is_staged {
            let path = self
                .lookup_table
                .with_mut(&hash, |lte| lte.staging_file_name.clone())
                .await
                .flatten()
                .ok_or(WimFsError::Io)?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await.map_err(WimFsError::from)?;
            file.set_len(size).await.map_err(WimFsError::from)?;
            self.lookup_table.with_mut(&hash, |lte| lte.original_size = size).await;
        } else {
            let mut tree = self.tree.lock().await;
            let new_hash =
                virtualizer::materialize(&mut tree, &self.lookup_table, &self.staging, self.codec.as_ref(), dentry, slot, size).await?;
            drop(tree);
            self.remap_after_materialize(new_hash).await;
        }
        Ok(())
    }

    /// spec §4.4 `mkdir`.
    pub async fn mkdir(&self, parent_ino: u64, name: &str) -> WimFsResult<u64> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let mut tree = self.tree.lock().await;
        let id = tree.mkdir(parent_dentry, name)?;
        Ok(id.0)
    }

    /// spec §4.4 `mknod`: creates a regular file node, or (for
    /// `STREAM_INTERFACE_WINDOWS`, when `name` addresses a stream on an
    /// existing regular file) attaches a new ADS entry instead. The
    /// child lookup is by basename within the parent (spec §9 ambiguous
    /// (i), resolved corrected).
    pub async fn mknod(&self, parent_ino: u64, name: &str) -> WimFsResult<u64> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }

        if self.config.stream_interface == StreamInterface::Windows {
            if let Some((base, stream)) = split_stream_name(name) {
                let mut tree = self.tree.lock().await;
                let base_dentry = tree.lookup_child(parent_dentry, base).ok_or(WimFsError::NoEnt)?;
                let ads_index = tree.add_ads(base_dentry, stream)?;
                return Ok(encode_ads_ino(base_dentry, ads_index));
            }
        }

        let mut tree = self.tree.lock().await;
        let id = tree.mknod(parent_dentry, name)?;
        Ok(id.0)
    }

    /// spec §4.4 Supplement: FUSE's atomic create-and-open, implemented as
    /// `mknod` followed by `open`.
    pub async fn create(&self, parent_ino: u64, name: &str) -> WimFsResult<(u64, u64)> {
        let ino = self.mknod(parent_ino, name).await?;
        let fh = self.open(ino, true).await?;
        Ok((ino, fh))
    }

    /// spec §4.4 `symlink`.
    pub async fn symlink(&self, parent_ino: u64, name: &str, target: &str) -> WimFsResult<u64> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let hash = self.codec.write_symlink_target(target).await?;
        let mut tree = self.tree.lock().await;
        let id = tree.symlink(parent_dentry, name, REPARSE_TAG_SYMLINK)?;
        if let Some(entry) = tree.get_mut(id) {
            entry.primary_hash = hash;
        }
        Ok(id.0)
    }

    /// spec §4.4 `readlink`.
    pub async fn readlink(&self, ino: u64) -> WimFsResult<String> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let hash = {
            let tree = self.tree.lock().await;
            let entry = tree.get(dentry).ok_or(WimFsError::NoEnt)?;
            if !entry.attributes.reparse_point {
                return Err(WimFsError::Inval);
            }
            entry.primary_hash
        };
        self.codec.read_symlink_target(&hash).await
    }

    /// spec §4.4 `unlink`.
    pub async fn unlink(&self, parent_ino: u64, name: &str) -> WimFsResult<()> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }

        if self.config.stream_interface == StreamInterface::Windows {
            if let Some((base, stream)) = split_stream_name(name) {
                let mut tree = self.tree.lock().await;
                let base_dentry = tree.lookup_child(parent_dentry, base).ok_or(WimFsError::NoEnt)?;
                let entry = tree.get_mut(base_dentry).ok_or(WimFsError::NoEnt)?;
                let index = entry.ads.iter().position(|ads| ads.name == stream).ok_or(WimFsError::NoEnt)?;
                let hash = entry.ads.remove(index).hash;
                drop(tree);
                self.dec_refcnt(hash).await;
                return Ok(());
            }
        }

        let target = {
            let tree = self.tree.lock().await;
            tree.lookup_child(parent_dentry, name).ok_or(WimFsError::NoEnt)?
        };
        let hashes = {
            let mut tree = self.tree.lock().await;
            tree.unlink(target)?
        };
        for hash in hashes {
            self.dec_refcnt(hash).await;
        }
        Ok(())
    }

    /// spec §4.4 `rmdir`.
    pub async fn rmdir(&self, parent_ino: u64, name: &str) -> WimFsResult<()> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        if parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let target = {
            let tree = self.tree.lock().await;
            tree.lookup_child(parent_dentry, name).ok_or(WimFsError::NoEnt)?
        };
        let mut tree = self.tree.lock().await;
        tree.rmdir(target)
    }

    /// spec §4.4 `rename`.
    pub async fn rename(&self, parent_ino: u64, name: &str, new_parent_ino: u64, new_name: &str) -> WimFsResult<()> {
        let (parent_dentry, parent_slot) = decode_ino(parent_ino);
        let (new_parent_dentry, new_parent_slot) = decode_ino(new_parent_ino);
        if parent_slot != HashSlot::Primary || new_parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let source = {
            let tree = self.tree.lock().await;
            tree.lookup_child(parent_dentry, name).ok_or(WimFsError::NoEnt)?
        };
        let replaced_hashes = {
            let mut tree = self.tree.lock().await;
            tree.rename(source, new_parent_dentry, new_name)?
        };
        for hash in replaced_hashes {
            self.dec_refcnt(hash).await;
        }
        Ok(())
    }

    /// spec §4.4 `link`.
    pub async fn link(&self, ino: u64, new_parent_ino: u64, new_name: &str) -> WimFsResult<u64> {
        let (target_dentry, target_slot) = decode_ino(ino);
        let (new_parent_dentry, new_parent_slot) = decode_ino(new_parent_ino);
        if target_slot != HashSlot::Primary {
            return Err(WimFsError::Perm);
        }
        if new_parent_slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let (new_id, hashes) = {
            let mut tree = self.tree.lock().await;
            tree.link(target_dentry, new_parent_dentry, new_name)?
        };
        for hash in hashes {
            self.inc_refcnt(hash).await;
        }
        Ok(new_id.0)
    }

    /// spec §4.4 `readdir`.
    pub async fn readdir(&self, ino: u64) -> WimFsResult<Vec<DirListEntry>> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let tree = self.tree.lock().await;
        let raw = tree.readdir(dentry)?;
        Ok(raw
            .into_iter()
            .map(|(name, id)| {
                let is_dir = tree.get(id).map(|entry| entry.attributes.directory).unwrap_or(true);
                DirListEntry { name, ino: id.0, is_dir }
            })
            .collect())
    }

    /// spec §4.4 `opendir`.
    pub async fn opendir(&self, ino: u64) -> WimFsResult<u64> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::NotDir);
        }
        let mut tree = self.tree.lock().await;
        let entry = tree.get(dentry).ok_or(WimFsError::NoEnt)?;
        if !entry.attributes.directory {
            return Err(WimFsError::NotDir);
        }
        tree.open(dentry)?;
        Ok(self.next_fh.fetch_add(1, Ordering::Relaxed))
    }

    /// spec §4.4 `releasedir`.
    pub async fn releasedir(&self, ino: u64) -> WimFsResult<()> {
        let (dentry, _slot) = decode_ino(ino);
        let mut tree = self.tree.lock().await;
        tree.release(dentry);
        Ok(())
    }

    /// spec §4.4 `release`: closes the handle, and if it was writable and
    /// the DE survives, stamps access and write timestamps.
    pub async fn release(&self, fh: u64, ino: u64) -> WimFsResult<()> {
        let (dentry, _slot) = decode_ino(ino);
        if fh != 0 {
            if let Some(hash) = self.open_files.lock().await.remove(&fh) {
                let writable = self
                    .lookup_table
                    .with_mut(&hash, |lte| {
                        let slot = lte.descriptors.find_by_id(fh);
                        let writable = slot.and_then(|s| lte.descriptors.get(s)).map(|h| h.writable).unwrap_or(false);
                        if let Some(slot) = slot {
                            lte.descriptors.close(slot);
                        }
                        writable
                    })
                    .await
                    .unwrap_or(false);

                if writable {
                    let mut tree = self.tree.lock().await;
                    if let Some(entry) = tree.get_mut(dentry) {
                        let now = windows_epoch_millis_now();
                        entry.atime_ms = now;
                        entry.mtime_ms = now;
                    }
                }

                let destroy = self
                    .lookup_table
                    .with_mut(&hash, |lte| lte.refcnt == 0 && lte.descriptors.num_opened() == 0)
                    .await
                    .unwrap_or(false);
                if destroy {
                    self.destroy_lte(hash).await;
                }
            }
        }
        let mut tree = self.tree.lock().await;
        tree.release(dentry);
        Ok(())
    }

    /// spec §4.4 `utimens`.
    pub async fn utimens(&self, ino: u64, atime: TimeUpdate, mtime: TimeUpdate) -> WimFsResult<()> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let now = windows_epoch_millis_now();
        let mut tree = self.tree.lock().await;
        let entry = tree.get_mut(dentry).ok_or(WimFsError::NoEnt)?;
        match atime {
            TimeUpdate::Unchanged => {}
            TimeUpdate::Now => entry.atime_ms = now,
            TimeUpdate::SetMillis(ms) => entry.atime_ms = ms,
        }
        match mtime {
            TimeUpdate::Unchanged => {}
            TimeUpdate::Now => entry.mtime_ms = now,
            TimeUpdate::SetMillis(ms) => entry.mtime_ms = ms,
        }
        Ok(())
    }

    /// spec §1 Non-goals: permission bits are not enforced; `access`
    /// always succeeds, mirroring `original_source/src/mount.c`'s
    /// `wimfs_access`.
    pub async fn access(&self, _ino: u64, _mask: i32) -> WimFsResult<()> {
        Ok(())
    }

    /// SPEC_FULL §4 Supplement: FUSE `flush` fires on every `close(2)` of
    /// a descriptor; there is no separate userspace write buffer to flush
    /// (`write` already writes straight to the staging fd), so this is a
    /// no-op.
    pub async fn flush(&self, _fh: u64) -> WimFsResult<()> {
        Ok(())
    }

    /// SPEC_FULL §4 Supplement: `fsync`/`fdatasync` against the staging
    /// fd.
    pub async fn fsync(&self, fh: u64, datasync: bool) -> WimFsResult<()> {
        if fh == 0 {
            return Ok(());
        }
        let hash = *self.open_files.lock().await.get(&fh).ok_or(WimFsError::Io)?;
        let fd = self.fd_for(fh, &hash).await?;
        sync_fd(fd, datasync)
    }

    async fn read_whole(&self, hash: ContentHash) -> WimFsResult<Vec<u8>> {
        if hash.is_zero() {
            return Ok(Vec::new());
        }
        let original_size = self.lookup_table.with_mut(&hash, |lte| lte.original_size).await.unwrap_or(0);
        let staged_path = self.lookup_table.with_mut(&hash, |lte| lte.staging_file_name.clone()).await.flatten();
        match staged_path {
            Some(path) => tokio::fs::read(&path).await.map_err(WimFsError::from),
            None => self.codec.read_resource(&hash, 0, original_size).await,
        }
    }

    /// SPEC_FULL §4 Supplement: `STREAM_INTERFACE_XATTR` exposes ADS
    /// entries as extended attributes rather than `name:stream` path
    /// suffixes; the underlying storage (a DE's `ads` vector) is the same.
    pub async fn get_xattr(&self, ino: u64, name: &str) -> WimFsResult<Vec<u8>> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let hash = {
            let tree = self.tree.lock().await;
            let entry = tree.get(dentry).ok_or(WimFsError::NoEnt)?;
            entry.ads.iter().find(|ads| ads.name == name).map(|ads| ads.hash).ok_or(WimFsError::NoData)?
        };
        self.read_whole(hash).await
    }

    pub async fn list_xattr(&self, ino: u64) -> WimFsResult<Vec<String>> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let tree = self.tree.lock().await;
        let entry = tree.get(dentry).ok_or(WimFsError::NoEnt)?;
        Ok(entry.ads.iter().map(|ads| ads.name.clone()).collect())
    }

    /// Upserts an extended attribute's value, routing the write through the
    /// Resource Virtualizer exactly like a regular-file write (spec §4.3).
    pub async fn set_xattr(&self, ino: u64, name: &str, value: &[u8]) -> WimFsResult<()> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let ads_index = {
            let mut tree = self.tree.lock().await;
            tree.ads_index_for_write(dentry, name)?
        };
        let hash = {
            let mut tree = self.tree.lock().await;
            let new_hash = virtualizer::materialize(
                &mut tree,
                &self.lookup_table,
                &self.staging,
                self.codec.as_ref(),
                dentry,
                HashSlot::Ads(ads_index),
                value.len() as u64,
            )
            .await?;
            new_hash
        };
        self.remap_after_materialize(hash).await;
        let path = self
            .lookup_table
            .with_mut(&hash, |lte| lte.staging_file_name.clone())
            .await
            .flatten()
            .ok_or(WimFsError::Io)?;
        tokio::fs::write(&path, value).await.map_err(WimFsError::from)?;
        self.lookup_table.with_mut(&hash, |lte| lte.original_size = value.len() as u64).await;
        Ok(())
    }

    pub async fn remove_xattr(&self, ino: u64, name: &str) -> WimFsResult<()> {
        let (dentry, slot) = decode_ino(ino);
        if slot != HashSlot::Primary {
            return Err(WimFsError::Inval);
        }
        let hash = {
            let mut tree = self.tree.lock().await;
            let entry = tree.get_mut(dentry).ok_or(WimFsError::NoEnt)?;
            let index = entry.ads.iter().position(|ads| ads.name == name).ok_or(WimFsError::NoData)?;
            entry.ads.remove(index).hash
        };
        self.dec_refcnt(hash).await;
        Ok(())
    }
}

/// Reads from a raw staging fd at `offset` without taking ownership of it
/// (the fd is owned by the `FileHandle` that outlives this call).
fn read_at(fd: RawFd, offset: u64, size: u32) -> WimFsResult<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    let mut buf = vec![0u8; size as usize];
    let mut total = 0usize;
    while total < buf.len() {
        let n = file.read_at(&mut buf[total..], offset + total as u64).map_err(WimFsError::from)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

fn write_at(fd: RawFd, offset: u64, data: &[u8]) -> WimFsResult<usize> {
    use std::os::unix::fs::FileExt;
    let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    let mut total = 0usize;
    while total < data.len() {
        let n = file.write_at(&data[total..], offset + total as u64).map_err(WimFsError::from)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn sync_fd(fd: RawFd, datasync: bool) -> WimFsResult<()> {
    let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    let result = if datasync { file.sync_data() } else { file.sync_all() };
    result.map_err(WimFsError::from)
}

use std::os::unix::io::FromRawFd;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InMemoryArchiveCodec;
    use tempfile::tempdir;

    async fn fixture() -> (WimFs, tempfile::TempDir) {
        let cwd = tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();
        let codec = Arc::new(InMemoryArchiveCodec::new());
        let fs = WimFs::new(codec, staging, MountConfig { read_write: true, ..Default::default() }, 1);
        (fs, cwd)
    }

    #[tokio::test]
    async fn create_write_read_round_trip() {
        let (fs, _cwd) = fixture().await;
        let root = fs.root_ino();
        let (ino, fh) = fs.create(root, "a.txt").await.unwrap();
        fs.write(fh, 0, b"hello").await.unwrap();
        fs.release(fh, ino).await.unwrap();

        let fh2 = fs.open(ino, false).await.unwrap();
        let bytes = fs.read(fh2, 0, 5).await.unwrap();
        assert_eq!(bytes, b"hello");
        fs.release(fh2, ino).await.unwrap();
    }

    #[tokio::test]
    async fn mkdir_then_readdir_lists_entry() {
        let (fs, _cwd) = fixture().await;
        let root = fs.root_ino();
        let dir_ino = fs.mkdir(root, "sub").await.unwrap();
        let listing = fs.readdir(root).await.unwrap();
        assert!(listing.iter().any(|e| e.name == "sub" && e.ino == dir_ino && e.is_dir));
    }

    #[tokio::test]
    async fn hard_link_shares_bytes_until_split() {
        let (fs, _cwd) = fixture().await;
        let root = fs.root_ino();
        let (a_ino, fh) = fs.create(root, "a").await.unwrap();
        fs.write(fh, 0, b"shared").await.unwrap();
        fs.release(fh, a_ino).await.unwrap();

        let b_ino = fs.link(a_ino, root, "b").await.unwrap();
        let fh_b = fs.open(b_ino, false).await.unwrap();
        assert_eq!(fs.read(fh_b, 0, 6).await.unwrap(), b"shared");
        fs.release(fh_b, b_ino).await.unwrap();

        // writing through `a` is visible through `b` before any split
        let fh_a2 = fs.open(a_ino, true).await.unwrap();
        fs.write(fh_a2, 0, b"X").await.unwrap();
        fs.release(fh_a2, a_ino).await.unwrap();
        let fh_b2 = fs.open(b_ino, false).await.unwrap();
        assert_eq!(&fs.read(fh_b2, 0, 1).await.unwrap(), b"X");
        fs.release(fh_b2, b_ino).await.unwrap();
    }

    #[tokio::test]
    async fn unlink_then_rmdir_enforce_kind_and_emptiness() {
        let (fs, _cwd) = fixture().await;
        let root = fs.root_ino();
        fs.mkdir(root, "d").await.unwrap();
        assert_eq!(fs.rmdir(root, "missing").await.unwrap_err(), WimFsError::NoEnt);
        fs.rmdir(root, "d").await.unwrap();

        fs.create(root, "f").await.unwrap();
        assert_eq!(fs.rmdir(root, "f").await.unwrap_err(), WimFsError::NotDir);
        fs.unlink(root, "f").await.unwrap();
        assert_eq!(fs.unlink(root, "f").await.unwrap_err(), WimFsError::NoEnt);
    }

    #[tokio::test]
    async fn ads_round_trip_under_windows_stream_interface() {
        let cwd = tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();
        let codec = Arc::new(InMemoryArchiveCodec::new());
        let config = MountConfig { read_write: true, stream_interface: StreamInterface::Windows, ..Default::default() };
        let fs = WimFs::new(codec, staging, config, 1);
        let root = fs.root_ino();
        fs.create(root, "doc.txt").await.unwrap();

        let (ads_ino, fh) = fs.create(root, "doc.txt:meta").await.unwrap();
        fs.write(fh, 0, b"stream-bytes").await.unwrap();
        fs.release(fh, ads_ino).await.unwrap();

        let (looked_up, attr) = fs.lookup(root, "doc.txt:meta").await.unwrap();
        assert_eq!(looked_up, ads_ino);
        assert_eq!(attr.size, 12);
    }
}
