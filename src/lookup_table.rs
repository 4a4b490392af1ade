//! Lookup Table Entries (LTEs), their descriptor vectors, and the
//! content-hash index that maps a resource's hash to its LTE.
//!
//! Grounded on `original_source/src/mount.c`'s `struct wimlib_lookup_table_entry`,
//! `alloc_wimlib_fd`, and `close_wimlib_fd` (spec §3, §4.2).

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use rand::RngCore;
use whirlwind::ShardMap;

use crate::error::{WimFsError, WimFsResult};
use crate::tree::HardLinkGroupId;

/// A 20-byte SHA-1 content hash. The all-zero hash means "no resource"
/// (an empty file with no LTE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 20]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// A random hash used to stand in for a staged resource's real content
    /// hash until the Commit Engine recomputes it (invariant I6).
    pub fn random_ephemeral() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        ContentHash(bytes)
    }
}

/// Where a resource's bytes live when it is archive-backed (not staged).
#[derive(Debug, Clone, Copy)]
pub struct ArchiveResource {
    pub offset: u64,
    pub size_in_archive: u64,
    pub compressed: bool,
}

/// Maximum live handles against a single stream (spec §3).
pub const MAX_HANDLES_PER_STREAM: u32 = 65_536;
/// Slot-vector growth increment (spec §4.2).
const GROWTH_BATCH: u32 = 8;

/// A single open context against one resource's byte stream (spec §3).
#[derive(Debug)]
pub struct FileHandle {
    /// Externally-visible identity handed back to the kernel bridge as the
    /// FUSE `fh`. Stable across materialize/split/commit, unlike the slot
    /// index or the owning LTE's hash, which both change (spec §1.2).
    pub id: u64,
    /// Stable index into the owning LTE's descriptor vector.
    pub slot: u32,
    /// The DE that opened this handle; nulled if that DE is removed while
    /// the handle stays open (spec §9, FH<->DE weak ownership).
    pub dentry: Option<crate::tree::DirEntryId>,
    /// Hard-link-group identity captured at open time; used by the
    /// Resource Virtualizer's split predicate (spec §4.2, §4.3).
    pub hard_link_group: HardLinkGroupId,
    /// Kernel fd into the staging file, present iff the owning LTE is
    /// staged (invariant I3).
    pub kernel_fd: Option<RawFd>,
    /// Opened for writing; governs whether `release` stamps timestamps
    /// (spec §4.4 `release`).
    pub writable: bool,
}

/// Descriptor vector: the sparse, growable array of [`FileHandle`]s inside
/// an LTE (spec §3, §4.2).
#[derive(Debug, Default)]
pub struct DescriptorVector {
    slots: Vec<Option<FileHandle>>,
    num_opened: u32,
}

impl DescriptorVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_opened(&self) -> u32 {
        self.num_opened
    }

    pub fn num_allocated(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Allocates a slot for `handle`, growing the vector in batches of
    /// [`GROWTH_BATCH`] if every existing slot is occupied. Scans from
    /// slot 0 so the first empty slot is reused (spec §4.2).
    pub fn allocate(&mut self, mut handle: FileHandle) -> WimFsResult<u32> {
        if let Some(index) = self.slots.iter().position(|slot| slot.is_none()) {
            handle.slot = index as u32;
            self.slots[index] = Some(handle);
            self.num_opened += 1;
            return Ok(index as u32);
        }

        if self.slots.len() as u32 >= MAX_HANDLES_PER_STREAM {
            return Err(WimFsError::MFile);
        }
        let grow_to = (self.slots.len() as u32 + GROWTH_BATCH).min(MAX_HANDLES_PER_STREAM);
        let index = self.slots.len();
        self.slots.resize_with(grow_to as usize, || None);
        handle.slot = index as u32;
        self.slots[index] = Some(handle);
        self.num_opened += 1;
        Ok(index as u32)
    }

    /// Closes the handle at `slot`, closing its kernel fd if any.
    pub fn close(&mut self, slot: u32) -> Option<FileHandle> {
        let entry = self.slots.get_mut(slot as usize)?.take()?;
        if let Some(fd) = entry.kernel_fd {
            close_raw_fd(fd);
        }
        self.num_opened -= 1;
        Some(entry)
    }

    pub fn get(&self, slot: u32) -> Option<&FileHandle> {
        self.slots.get(slot as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut FileHandle> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    /// Finds the slot currently holding the handle identified by `id`
    /// (spec §9 "Cyclic ownership" — the ops layer tracks handles by this
    /// stable id rather than by slot, since the slot moves on split).
    pub fn find_by_id(&self, id: u64) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| slot.as_ref().filter(|fh| fh.id == id).map(|_| index as u32))
    }

    /// Every live handle id in this vector, for fh-table remapping after a
    /// materialize call installs a new LTE (spec §4.3 step 5).
    pub fn ids(&self) -> Vec<u64> {
        self.slots.iter().flatten().map(|fh| fh.id).collect()
    }

    /// Moves every handle matching `predicate` into a fresh, densely
    /// re-indexed descriptor vector, leaving non-matching handles in place
    /// (spec §4.2 split transfer).
    pub fn split_transfer(&mut self, predicate: impl Fn(&FileHandle) -> bool) -> DescriptorVector {
        let mut moved = DescriptorVector::new();
        for slot in &mut self.slots {
            let matches = slot.as_ref().map(&predicate).unwrap_or(false);
            if matches {
                if let Some(mut handle) = slot.take() {
                    self.num_opened -= 1;
                    let new_slot = moved.slots.len() as u32;
                    handle.slot = new_slot;
                    moved.slots.push(Some(handle));
                    moved.num_opened += 1;
                }
            }
        }
        moved
    }
}

#[cfg(target_os = "linux")]
fn close_raw_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(not(target_os = "linux"))]
fn close_raw_fd(_fd: RawFd) {}

/// One content-addressed resource (spec §3).
#[derive(Debug)]
pub struct LookupTableEntry {
    pub hash: ContentHash,
    pub refcnt: u32,
    pub descriptors: DescriptorVector,
    /// Logical byte length, valid whether the resource is archive-backed
    /// or staged (spec §3, §4.3 step 5 `resource.original_size`).
    pub original_size: u64,
    /// `None` once the resource has been materialized to staging.
    pub archive_resource: Option<ArchiveResource>,
    /// The one authoritative bit distinguishing "lives in the archive"
    /// from "lives on local disk" (spec §3).
    pub staging_file_name: Option<PathBuf>,
}

impl LookupTableEntry {
    pub fn is_staged(&self) -> bool {
        self.staging_file_name.is_some()
    }
}

/// The content-hash index: `Hash -> LTE` (spec §3). Backed by a sharded
/// concurrent map so the type matches the shape a multi-reader mount would
/// need, even though the single-threaded cooperative scheduler (spec §5)
/// never actually contends on it.
pub struct LookupTable {
    by_hash: ShardMap<ContentHash, LookupTableEntry>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self { by_hash: ShardMap::new() }
    }

    pub async fn insert(&self, lte: LookupTableEntry) {
        self.by_hash.insert(lte.hash, lte).await;
    }

    pub async fn remove(&self, hash: &ContentHash) -> Option<LookupTableEntry> {
        self.by_hash.remove(hash).await
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        self.by_hash.contains_key(hash).await
    }

    /// Runs `f` with mutable access to the LTE for `hash`, if present.
    pub async fn with_mut<R>(&self, hash: &ContentHash, f: impl FnOnce(&mut LookupTableEntry) -> R) -> Option<R> {
        let mut guard = self.by_hash.get_mut(hash).await?;
        Some(f(&mut *guard))
    }
}

impl Default for LookupTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(group: HardLinkGroupId) -> FileHandle {
        FileHandle { id: 0, slot: 0, dentry: None, hard_link_group: group, kernel_fd: None, writable: false }
    }

    #[test]
    fn allocate_reuses_first_empty_slot() {
        let mut descriptors = DescriptorVector::new();
        let a = descriptors.allocate(handle(HardLinkGroupId(1))).unwrap();
        let b = descriptors.allocate(handle(HardLinkGroupId(1))).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        descriptors.close(a);
        let c = descriptors.allocate(handle(HardLinkGroupId(1))).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn split_transfer_moves_only_matching_handles() {
        let mut descriptors = DescriptorVector::new();
        descriptors.allocate(handle(HardLinkGroupId(1))).unwrap();
        descriptors.allocate(handle(HardLinkGroupId(2))).unwrap();
        descriptors.allocate(handle(HardLinkGroupId(1))).unwrap();

        let moved = descriptors.split_transfer(|h| h.hard_link_group == HardLinkGroupId(1));
        assert_eq!(moved.num_opened(), 2);
        assert_eq!(descriptors.num_opened(), 1);
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(!ContentHash::random_ephemeral().is_zero());
    }
}
