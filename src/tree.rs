//! The in-memory directory tree: directory entries (DEs), alternate data
//! stream (ADS) entries, and hard-link groups (spec §3).
//!
//! Grounded on `original_source/src/mount.c`'s dentry operations and on
//! the id-registry style of `examples/shadow_fs/fs/state.rs` (a flat
//! `HashMap<Id, _>` with a monotonic counter, rather than the original's
//! intrusive pointers).

use std::collections::HashMap;

use crate::error::{WimFsError, WimFsResult};
use crate::lookup_table::ContentHash;

/// Stable identity for a [`DirEntry`]. Doubles as the FUSE inode number
/// (spec §3 Supplement: "Inode numbers") since both need an identity that
/// survives content-hash changes across materialize/commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirEntryId(pub u64);

/// Identifies a set of DEs sharing content and canonical metadata
/// (spec §3, §9 Glossary "Hard-link group").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardLinkGroupId(pub u64);

pub const ROOT_ID: DirEntryId = DirEntryId(1);

/// Attribute bits relevant to this layer (spec §3: "attributes bitmap
/// (DIRECTORY, REPARSE_POINT, ...)"). POSIX permission bits are out of
/// scope (spec §1 Non-goals).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub directory: bool,
    pub reparse_point: bool,
    pub readonly: bool,
    pub hidden: bool,
}

/// Which peer in a hard-link group owns the canonical metadata
/// (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardLinkRole {
    Master,
    Slave,
}

/// Named secondary byte stream attached to a DE (spec §3).
#[derive(Debug, Clone)]
pub struct AdsEntry {
    pub name: String,
    pub hash: ContentHash,
}

/// A hash slot: either a DE's primary stream or one of its ADS entries.
/// Handlers operate on this abstraction rather than branching on
/// primary-vs-ADS at every call site (spec §9 "Hash-slot uniformity").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSlot {
    Primary,
    Ads(usize),
}

/// One name in the mounted tree (spec §3).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub id: DirEntryId,
    pub name: String,
    pub attributes: FileAttributes,
    pub primary_hash: ContentHash,
    pub reparse_tag: u32,
    pub ads: Vec<AdsEntry>,
    /// Milliseconds since the Windows epoch (spec §4.4 `utimens`).
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub hard_link_group: HardLinkGroupId,
    pub hard_link_role: HardLinkRole,
    pub parent: Option<DirEntryId>,
    pub children: Vec<DirEntryId>,
    /// Live FH/lookup references that defer destruction past unlink
    /// (spec §3 invariant I4, §4.4 supplement `forget`/lookup-count).
    pub open_count: u32,
    pub lookup_count: u64,
    /// Set once removed from its parent's child list; the DE object
    /// itself survives until `open_count == 0 && lookup_count == 0`.
    pub unlinked: bool,
}

impl DirEntry {
    pub fn hash_slot(&self, slot: HashSlot) -> ContentHash {
        match slot {
            HashSlot::Primary => self.primary_hash,
            HashSlot::Ads(index) => self.ads[index].hash,
        }
    }

    pub fn set_hash_slot(&mut self, slot: HashSlot, hash: ContentHash) {
        match slot {
            HashSlot::Primary => self.primary_hash = hash,
            HashSlot::Ads(index) => self.ads[index].hash = hash,
        }
    }

    /// Every hash slot this DE references (primary, then each ADS), for
    /// refcount bookkeeping and rehashing (spec §4.5 Commit Engine step 2).
    pub fn all_slots(&self) -> Vec<HashSlot> {
        let mut slots = vec![HashSlot::Primary];
        slots.extend((0..self.ads.len()).map(HashSlot::Ads));
        slots
    }

    pub fn is_referenced(&self) -> bool {
        self.open_count > 0 || self.lookup_count > 0
    }
}

/// The in-memory directory tree (spec §3). Owns all [`DirEntry`]s and
/// hard-link-group membership; does not own LTEs (those live in
/// [`crate::lookup_table::LookupTable`]) — refcount adjustments on the
/// referenced LTEs are the caller's responsibility, since the tree has no
/// access to the lookup table.
pub struct Tree {
    entries: HashMap<DirEntryId, DirEntry>,
    /// Membership list per hard-link group, maintained alongside `entries`
    /// so the Resource Virtualizer can compute `link_group_size` (spec
    /// §4.3) without a linear scan. Only DEs currently in the live tree
    /// (attached, not `unlinked`) are members.
    hard_link_groups: HashMap<HardLinkGroupId, Vec<DirEntryId>>,
    next_id: u64,
    next_hard_link_group: u64,
}

impl Tree {
    /// A fresh tree containing only the root directory.
    pub fn new() -> Self {
        let root = DirEntry {
            id: ROOT_ID,
            name: String::new(),
            attributes: FileAttributes { directory: true, ..Default::default() },
            primary_hash: ContentHash::ZERO,
            reparse_tag: 0,
            ads: Vec::new(),
            atime_ms: 0,
            mtime_ms: 0,
            hard_link_group: HardLinkGroupId(0),
            hard_link_role: HardLinkRole::Master,
            parent: None,
            children: Vec::new(),
            open_count: 0,
            lookup_count: 0,
            unlinked: false,
        };
        let mut entries = HashMap::new();
        entries.insert(ROOT_ID, root);
        let mut hard_link_groups = HashMap::new();
        hard_link_groups.insert(HardLinkGroupId(0), vec![ROOT_ID]);
        Self { entries, hard_link_groups, next_id: ROOT_ID.0 + 1, next_hard_link_group: 1 }
    }

    /// Number of live DEs belonging to `group` (spec §4.3 `link_group_size`).
    pub fn hard_link_group_size(&self, group: HardLinkGroupId) -> usize {
        self.hard_link_groups.get(&group).map(Vec::len).unwrap_or(0)
    }

    /// Every live DE belonging to `group` (spec §4.3 step 5 propagation: a
    /// hard-link peer's primary/ADS hash field is denormalized per-DE, so
    /// when one peer's resource diverges, every peer sharing that slot must
    /// be updated to keep invariant I1 — `LTE.refcnt` equal to the number of
    /// tree hash slots actually holding `LTE.hash` — true).
    pub fn group_members(&self, group: HardLinkGroupId) -> Vec<DirEntryId> {
        self.hard_link_groups.get(&group).cloned().unwrap_or_default()
    }

    fn join_group(&mut self, group: HardLinkGroupId, id: DirEntryId) {
        self.hard_link_groups.entry(group).or_default().push(id);
    }

    fn leave_group(&mut self, id: DirEntryId) {
        let group = match self.entries.get(&id) {
            Some(entry) => entry.hard_link_group,
            None => return,
        };
        if let Some(members) = self.hard_link_groups.get_mut(&group) {
            members.retain(|&member| member != id);
            if members.is_empty() {
                self.hard_link_groups.remove(&group);
            }
        }
    }

    pub fn root(&self) -> DirEntryId {
        ROOT_ID
    }

    pub fn get(&self, id: DirEntryId) -> Option<&DirEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: DirEntryId) -> Option<&mut DirEntry> {
        self.entries.get_mut(&id)
    }

    fn alloc_id(&mut self) -> DirEntryId {
        let id = DirEntryId(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_hard_link_group(&mut self) -> HardLinkGroupId {
        let id = HardLinkGroupId(self.next_hard_link_group);
        self.next_hard_link_group += 1;
        id
    }

    /// Finds a direct child of `parent` named `name`.
    pub fn lookup_child(&self, parent: DirEntryId, name: &str) -> Option<DirEntryId> {
        let parent = self.entries.get(&parent)?;
        parent
            .children
            .iter()
            .copied()
            .find(|&child| self.entries.get(&child).map(|de| de.name == name).unwrap_or(false))
    }

    /// Resolves a `/`-separated path from the root. Returns `ENOTDIR` if a
    /// non-terminal component is not a directory, `ENOENT` if any
    /// component is missing (spec §4.4 `lookup`).
    pub fn resolve(&self, path: &str) -> WimFsResult<DirEntryId> {
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let current_entry = self.get(current).ok_or(WimFsError::NoEnt)?;
            if !current_entry.attributes.directory {
                return Err(WimFsError::NotDir);
            }
            current = self.lookup_child(current, component).ok_or(WimFsError::NoEnt)?;
        }
        Ok(current)
    }

    /// Creates a new, unlinked DE not yet attached to any parent. Callers
    /// attach it with [`Tree::attach`].
    fn new_entry(&mut self, name: String, attributes: FileAttributes) -> DirEntry {
        let id = self.alloc_id();
        let hard_link_group = self.alloc_hard_link_group();
        DirEntry {
            id,
            name,
            attributes,
            primary_hash: ContentHash::ZERO,
            reparse_tag: 0,
            ads: Vec::new(),
            atime_ms: 0,
            mtime_ms: 0,
            hard_link_group,
            hard_link_role: HardLinkRole::Master,
            parent: None,
            children: Vec::new(),
            open_count: 0,
            lookup_count: 0,
            unlinked: false,
        }
    }

    fn attach(&mut self, parent: DirEntryId, entry: DirEntry) -> WimFsResult<DirEntryId> {
        let id = entry.id;
        {
            let parent_entry = self.entries.get_mut(&parent).ok_or(WimFsError::NoEnt)?;
            if !parent_entry.attributes.directory {
                return Err(WimFsError::NotDir);
            }
            parent_entry.children.push(id);
        }
        let mut entry = entry;
        entry.parent = Some(parent);
        let group = entry.hard_link_group;
        self.entries.insert(id, entry);
        self.join_group(group, id);
        Ok(id)
    }

    /// Creates a directory under `parent` (spec §4.4 `mkdir`). Parent must
    /// exist and be a directory; `name` must not already exist.
    pub fn mkdir(&mut self, parent: DirEntryId, name: &str) -> WimFsResult<DirEntryId> {
        self.create_checked(parent, name, FileAttributes { directory: true, ..Default::default() })
    }

    /// Creates a regular file DE under `parent` (spec §4.4 `mkdir`/`mknod`).
    pub fn mknod(&mut self, parent: DirEntryId, name: &str) -> WimFsResult<DirEntryId> {
        self.create_checked(parent, name, FileAttributes::default())
    }

    /// Creates a symlink DE under `parent` (spec §4.4 `symlink`). The
    /// reparse tag/target bytes are filled in by the caller through the
    /// codec; this only establishes the tree node and its attribute bit.
    pub fn symlink(&mut self, parent: DirEntryId, name: &str, reparse_tag: u32) -> WimFsResult<DirEntryId> {
        let id = self.create_checked(parent, name, FileAttributes { reparse_point: true, ..Default::default() })?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.reparse_tag = reparse_tag;
        }
        Ok(id)
    }

    fn create_checked(&mut self, parent: DirEntryId, name: &str, attributes: FileAttributes) -> WimFsResult<DirEntryId> {
        if self.lookup_child(parent, name).is_some() {
            return Err(WimFsError::Exist);
        }
        let entry = self.new_entry(name.to_string(), attributes);
        self.attach(parent, entry)
    }

    /// Creates a new DE sharing every hash slot with `target`, splicing it
    /// into `target`'s hard-link group as a slave (spec §4.4 `link`).
    /// Returns the new DE id and the list of hash slots whose LTE refcount
    /// the caller must increment.
    pub fn link(&mut self, target: DirEntryId, parent: DirEntryId, name: &str) -> WimFsResult<(DirEntryId, Vec<ContentHash>)> {
        if self.lookup_child(parent, name).is_some() {
            return Err(WimFsError::Exist);
        }
        let target_entry = self.entries.get(&target).ok_or(WimFsError::NoEnt)?;
        if target_entry.attributes.directory {
            return Err(WimFsError::Perm);
        }
        let hard_link_group = target_entry.hard_link_group;
        let primary_hash = target_entry.primary_hash;
        let ads = target_entry.ads.clone();
        let attributes = target_entry.attributes;

        let mut new_entry = self.new_entry(name.to_string(), attributes);
        new_entry.hard_link_group = hard_link_group;
        new_entry.hard_link_role = HardLinkRole::Slave;
        new_entry.primary_hash = primary_hash;
        new_entry.ads = ads.clone();

        let hashes: Vec<ContentHash> = std::iter::once(primary_hash).chain(ads.iter().map(|a| a.hash)).collect();
        let new_id = self.attach(parent, new_entry)?;
        Ok((new_id, hashes))
    }

    /// Detaches `id` from its parent. If its `open_count`/`lookup_count`
    /// are both zero, the entry is dropped immediately; otherwise it is
    /// kept, marked `unlinked` (spec §3 invariant I4, §4.4 `unlink`).
    /// Returns every hash slot the removed DE referenced, for LTE refcount
    /// bookkeeping by the caller.
    pub fn unlink(&mut self, id: DirEntryId) -> WimFsResult<Vec<ContentHash>> {
        let entry = self.entries.get(&id).ok_or(WimFsError::NoEnt)?;
        if entry.attributes.directory {
            return Err(WimFsError::IsDir);
        }
        let parent = entry.parent;
        let hashes: Vec<ContentHash> = std::iter::once(entry.primary_hash).chain(entry.ads.iter().map(|a| a.hash)).collect();

        if let Some(parent) = parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.children.retain(|&child| child != id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.unlinked = true;
        }
        self.leave_group(id);
        self.release_if_unreferenced(id);
        Ok(hashes)
    }

    /// Removes an empty directory. `ENOTEMPTY` if it has children;
    /// deferred (marked `unlinked`, not freed) if its open count is
    /// non-zero (spec §4.4 `rmdir`).
    pub fn rmdir(&mut self, id: DirEntryId) -> WimFsResult<()> {
        let entry = self.entries.get(&id).ok_or(WimFsError::NoEnt)?;
        if !entry.attributes.directory {
            return Err(WimFsError::NotDir);
        }
        if !entry.children.is_empty() {
            return Err(WimFsError::NotEmpty);
        }
        let parent = entry.parent;
        if let Some(parent) = parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.children.retain(|&child| child != id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.unlinked = true;
        }
        self.leave_group(id);
        self.release_if_unreferenced(id);
        Ok(())
    }

    /// Renames `source` to `name` under `new_parent`. Rename-over-empty-dir
    /// is permitted; regular-over-directory is rejected; directory-over-
    /// non-empty is rejected; same-path is a no-op (spec §4.4 `rename`).
    /// Returns every hash slot a replaced destination file referenced, for
    /// LTE refcount bookkeeping by the caller (mirrors `unlink`'s contract).
    pub fn rename(&mut self, source: DirEntryId, new_parent: DirEntryId, name: &str) -> WimFsResult<Vec<ContentHash>> {
        let source_is_dir = self.entries.get(&source).ok_or(WimFsError::NoEnt)?.attributes.directory;
        let mut replaced_hashes = Vec::new();

        if let Some(existing) = self.lookup_child(new_parent, name) {
            if existing == source {
                return Ok(replaced_hashes);
            }
            let existing_entry = self.entries.get(&existing).ok_or(WimFsError::NoEnt)?;
            if source_is_dir && !existing_entry.attributes.directory {
                return Err(WimFsError::NotDir);
            }
            if !source_is_dir && existing_entry.attributes.directory {
                return Err(WimFsError::IsDir);
            }
            if existing_entry.attributes.directory {
                if !existing_entry.children.is_empty() {
                    return Err(WimFsError::NotEmpty);
                }
                if let Some(parent_entry) = self.entries.get_mut(&new_parent) {
                    parent_entry.children.retain(|&child| child != existing);
                }
                if let Some(entry) = self.entries.get_mut(&existing) {
                    entry.unlinked = true;
                }
                self.leave_group(existing);
                self.release_if_unreferenced(existing);
            } else {
                replaced_hashes = self.unlink(existing)?;
            }
        }

        let old_parent = self.entries.get(&source).ok_or(WimFsError::NoEnt)?.parent;
        if let Some(old_parent) = old_parent {
            if let Some(parent_entry) = self.entries.get_mut(&old_parent) {
                parent_entry.children.retain(|&child| child != source);
            }
        }
        if let Some(entry) = self.entries.get_mut(&source) {
            entry.name = name.to_string();
            entry.parent = Some(new_parent);
        }
        if let Some(parent_entry) = self.entries.get_mut(&new_parent) {
            parent_entry.children.push(source);
        }
        Ok(replaced_hashes)
    }

    /// Attaches a new, empty alternate data stream named `name` to the
    /// regular file `id` (spec §4.4 `mkdir`/`mknod` Windows stream-
    /// interface supplement). `EISDIR` if `id` is a directory, `EEXIST` if
    /// a stream by that name already exists.
    pub fn add_ads(&mut self, id: DirEntryId, name: &str) -> WimFsResult<usize> {
        let entry = self.entries.get_mut(&id).ok_or(WimFsError::NoEnt)?;
        if entry.attributes.directory {
            return Err(WimFsError::IsDir);
        }
        if entry.ads.iter().any(|ads| ads.name == name) {
            return Err(WimFsError::Exist);
        }
        entry.ads.push(AdsEntry { name: name.to_string(), hash: ContentHash::ZERO });
        Ok(entry.ads.len() - 1)
    }

    /// Finds `name`'s ADS index on `id`, creating an empty stream if it
    /// does not already exist (spec §4.4 Supplement: xattr stream
    /// interface `setxattr` is an upsert, unlike `mknod`'s `add_ads`).
    pub fn ads_index_for_write(&mut self, id: DirEntryId, name: &str) -> WimFsResult<usize> {
        let entry = self.entries.get_mut(&id).ok_or(WimFsError::NoEnt)?;
        if entry.attributes.directory {
            return Err(WimFsError::IsDir);
        }
        if let Some(index) = entry.ads.iter().position(|ads| ads.name == name) {
            return Ok(index);
        }
        entry.ads.push(AdsEntry { name: name.to_string(), hash: ContentHash::ZERO });
        Ok(entry.ads.len() - 1)
    }

    /// Increments the DE's open count (`open`/`opendir`).
    pub fn open(&mut self, id: DirEntryId) -> WimFsResult<()> {
        self.entries.get_mut(&id).ok_or(WimFsError::NoEnt)?.open_count += 1;
        Ok(())
    }

    /// Decrements the DE's open count (`release`/`releasedir`), freeing the
    /// entry if it is unlinked and now unreferenced.
    pub fn release(&mut self, id: DirEntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.open_count = entry.open_count.saturating_sub(1);
        }
        self.release_if_unreferenced(id);
    }

    /// `lookup` reply bookkeeping (spec §4.4 Supplement `forget`).
    pub fn lookup_ref(&mut self, id: DirEntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.lookup_count += 1;
        }
    }

    /// Kernel `forget(nlookup)` (spec §4.4 Supplement `forget`).
    pub fn forget(&mut self, id: DirEntryId, nlookup: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
        }
        self.release_if_unreferenced(id);
    }

    /// Frees the DE for `id` if it has been detached from the tree
    /// (`unlinked`) and nothing still references it (spec §3 invariant I4,
    /// §9 "Deferred DE destruction").
    fn release_if_unreferenced(&mut self, id: DirEntryId) {
        let free = match self.entries.get(&id) {
            Some(entry) => entry.unlinked && !entry.is_referenced(),
            None => false,
        };
        if free {
            self.entries.remove(&id);
        }
    }

    /// Every DE currently in the tree, including ones marked `unlinked` but
    /// still referenced (spec §4.5 Commit Engine step 2 walks every DE's
    /// hash slots regardless of link state).
    pub fn all_ids(&self) -> Vec<DirEntryId> {
        self.entries.keys().copied().collect()
    }

    /// Lists `.`, `..`, then children in order (spec §4.4 `readdir`; a plain
    /// `Vec` substitutes for the original's circular child list while
    /// preserving the same enumeration order).
    pub fn readdir(&self, id: DirEntryId) -> WimFsResult<Vec<(String, DirEntryId)>> {
        let entry = self.entries.get(&id).ok_or(WimFsError::NoEnt)?;
        if !entry.attributes.directory {
            return Err(WimFsError::NotDir);
        }
        let parent = entry.parent.unwrap_or(id);
        let mut out = vec![(".".to_string(), id), ("..".to_string(), parent)];
        for &child in &entry.children {
            if let Some(child_entry) = self.entries.get(&child) {
                out.push((child_entry.name.clone(), child));
            }
        }
        Ok(out)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_then_lookup_round_trips() {
        let mut tree = Tree::new();
        let dir = tree.mkdir(tree.root(), "x").unwrap();
        assert_eq!(tree.resolve("/x").unwrap(), dir);
    }

    #[test]
    fn mkdir_duplicate_name_fails_exist() {
        let mut tree = Tree::new();
        tree.mkdir(tree.root(), "x").unwrap();
        assert_eq!(tree.mkdir(tree.root(), "x").unwrap_err(), WimFsError::Exist);
    }

    #[test]
    fn resolve_missing_component_is_noent() {
        let tree = Tree::new();
        assert_eq!(tree.resolve("/missing").unwrap_err(), WimFsError::NoEnt);
    }

    #[test]
    fn resolve_through_file_is_notdir() {
        let mut tree = Tree::new();
        tree.mknod(tree.root(), "a").unwrap();
        assert_eq!(tree.resolve("/a/b").unwrap_err(), WimFsError::NotDir);
    }

    #[test]
    fn rename_over_empty_dir_succeeds_and_non_empty_rmdir_fails() {
        let mut tree = Tree::new();
        let x = tree.mkdir(tree.root(), "x").unwrap();
        tree.mkdir(tree.root(), "y").unwrap();
        tree.rename(x, tree.root(), "y").unwrap();
        let y = tree.resolve("/y").unwrap();
        tree.mkdir(y, "z").unwrap();
        assert_eq!(tree.rmdir(y).unwrap_err(), WimFsError::NotEmpty);
    }

    #[test]
    fn unlink_defers_destruction_while_open() {
        let mut tree = Tree::new();
        let file = tree.mknod(tree.root(), "f").unwrap();
        tree.open(file).unwrap();
        tree.unlink(file).unwrap();
        assert!(tree.get(file).is_some());
        tree.release(file);
        assert!(tree.get(file).is_none());
    }

    #[test]
    fn link_shares_hash_slots_and_marks_slave() {
        let mut tree = Tree::new();
        let a = tree.mknod(tree.root(), "a").unwrap();
        tree.get_mut(a).unwrap().primary_hash = ContentHash::random_ephemeral();
        let hash = tree.get(a).unwrap().primary_hash;
        let (b, hashes) = tree.link(a, tree.root(), "b").unwrap();
        assert_eq!(hashes, vec![hash]);
        assert_eq!(tree.get(b).unwrap().hard_link_role, HardLinkRole::Slave);
        assert_eq!(tree.get(b).unwrap().hard_link_group, tree.get(a).unwrap().hard_link_group);
        assert_eq!(tree.hard_link_group_size(tree.get(a).unwrap().hard_link_group), 2);
        tree.unlink(b).unwrap();
        assert_eq!(tree.hard_link_group_size(tree.get(a).unwrap().hard_link_group), 1);
    }

    #[test]
    fn readdir_lists_dot_dotdot_and_children_in_order() {
        let mut tree = Tree::new();
        tree.mkdir(tree.root(), "a").unwrap();
        tree.mkdir(tree.root(), "b").unwrap();
        let names: Vec<String> = tree.readdir(tree.root()).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
    }
}
