//! Resource Virtualizer: decides when to materialize a resource to
//! staging, and whether to share or split a content-hash entry
//! (spec §4.3).
//!
//! Grounded step-for-step on `original_source/src/mount.c`'s
//! `extract_resource_to_staging_dir` (the share-or-split decision at
//! `link_group_size == old_lte->refcnt`).

use tracing::debug;

use crate::codec::ArchiveCodec;
use crate::error::WimFsResult;
use crate::lookup_table::{ArchiveResource, ContentHash, LookupTable, LookupTableEntry};
use crate::staging::StagingStore;
use crate::tree::{DirEntryId, HashSlot, Tree};

/// Materializes the resource referenced by `dentry`'s `slot`, truncating
/// the staging copy's logical size to `truncate_to_size`. Returns the hash
/// the new (or reused) LTE was installed under.
///
/// Per spec §4.3: if the slot already names a staged LTE, this is a no-op
/// safety net — callers (`open`, `truncate`) already route directly-staged
/// writes through the staging file without calling this.
pub async fn materialize(
    tree: &mut Tree,
    lookup_table: &LookupTable,
    staging: &StagingStore,
    codec: &dyn ArchiveCodec,
    dentry: DirEntryId,
    slot: HashSlot,
    truncate_to_size: u64,
) -> WimFsResult<ContentHash> {
    let old_hash = {
        let entry = tree.get(dentry).ok_or(crate::error::WimFsError::NoEnt)?;
        entry.hash_slot(slot)
    };

    if !old_hash.is_zero() {
        if let Some(already_staged) = lookup_table.with_mut(&old_hash, |lte| lte.is_staged()).await {
            if already_staged {
                debug!(?old_hash, "materialize: already staged, no-op");
                return Ok(old_hash);
            }
        }
    }

    // Step 1: create the staging file, open for write.
    let (staging_path, mut staging_file) = staging.create().await?;

    // Step 2: extract archive bytes into it, unless the slot is empty.
    if !old_hash.is_zero() {
        let bytes = codec.read_resource(&old_hash, 0, truncate_to_size).await.map_err(|err| {
            // Best-effort cleanup; materialize leaves no partial state on failure (spec §4.3 step 6).
            err
        });
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&staging_path).await;
                return Err(err);
            }
        };
        if let Err(err) = crate::staging::write_all(&mut staging_file, &bytes).await {
            let _ = tokio::fs::remove_file(&staging_path).await;
            return Err(err);
        }
    }
    drop(staging_file);

    // Step 3: hard-link group size for this dentry.
    let group = tree.get(dentry).ok_or(crate::error::WimFsError::NoEnt)?.hard_link_group;
    let link_group_size = tree.hard_link_group_size(group) as u32;

    // Step 4: share-or-split decision.
    let new_lte = if old_hash.is_zero() {
        LookupTableEntry {
            hash: old_hash,
            refcnt: link_group_size,
            descriptors: crate::lookup_table::DescriptorVector::new(),
            original_size: truncate_to_size,
            archive_resource: None,
            staging_file_name: None,
        }
    } else {
        let old_lte = lookup_table.remove(&old_hash).await;
        match old_lte {
            Some(mut old_lte) if old_lte.refcnt == link_group_size => {
                debug!(?old_hash, "materialize: sole user of LTE, reusing");
                old_lte.hash = old_hash;
                old_lte
            }
            Some(mut old_lte) => {
                debug!(?old_hash, "materialize: splitting LTE");
                let moved = old_lte.descriptors.split_transfer(|fh| fh.hard_link_group == group);
                old_lte.refcnt -= link_group_size.min(old_lte.refcnt);
                lookup_table.insert(old_lte).await;
                LookupTableEntry {
                    hash: old_hash,
                    refcnt: link_group_size,
                    descriptors: moved,
                    original_size: truncate_to_size,
                    archive_resource: None,
                    staging_file_name: None,
                }
            }
            None => LookupTableEntry {
                hash: old_hash,
                refcnt: link_group_size,
                descriptors: crate::lookup_table::DescriptorVector::new(),
                original_size: truncate_to_size,
                archive_resource: None,
                staging_file_name: None,
            },
        }
    };

    // Step 5: populate the new LTE with an ephemeral hash and install it.
    // Archive location is irrelevant once staged.
    let mut new_lte = new_lte;
    new_lte.hash = ContentHash::random_ephemeral();
    new_lte.original_size = truncate_to_size;
    new_lte.archive_resource = None;
    new_lte.staging_file_name = Some(staging_path.clone());
    let ephemeral_hash = new_lte.hash;

    // Handles carried into new_lte (reuse or split) were opened while this
    // resource was still archive-backed, so they hold no kernel fd. The LTE
    // is staged from this point on, so invariant I3 requires one now.
    for id in new_lte.descriptors.ids() {
        let slot = match new_lte.descriptors.find_by_id(id) {
            Some(slot) => slot,
            None => continue,
        };
        let writable = match new_lte.descriptors.get(slot) {
            Some(handle) if handle.kernel_fd.is_none() => handle.writable,
            _ => continue,
        };
        let fd = crate::staging::open_fd(&staging_path, writable)?;
        if let Some(handle) = new_lte.descriptors.get_mut(slot) {
            handle.kernel_fd = Some(fd);
        }
    }

    lookup_table.insert(new_lte).await;

    if let Some(entry) = tree.get_mut(dentry) {
        entry.set_hash_slot(slot, ephemeral_hash);
    }

    // Propagate the new identity to every other hard-link peer that shares
    // this slot. Each DE carries its own denormalized hash field rather than
    // a shared pointer, so without this step only `dentry` would track the
    // new LTE while its peers kept pointing at the now-orphaned old hash —
    // violating I1 and scenario "Hard-link group share" (§8), where a write
    // through one peer must be immediately visible through the others.
    let ads_name = match slot {
        HashSlot::Primary => None,
        HashSlot::Ads(index) => tree.get(dentry).and_then(|e| e.ads.get(index)).map(|a| a.name.clone()),
    };
    for peer in tree.group_members(group) {
        if peer == dentry {
            continue;
        }
        if let Some(entry) = tree.get_mut(peer) {
            match &ads_name {
                None => {
                    if entry.primary_hash == old_hash {
                        entry.primary_hash = ephemeral_hash;
                    }
                }
                Some(name) => {
                    if let Some(ads) = entry.ads.iter_mut().find(|a| &a.name == name) {
                        if ads.hash == old_hash {
                            ads.hash = ephemeral_hash;
                        }
                    }
                }
            }
        }
    }

    Ok(ephemeral_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InMemoryArchiveCodec;
    use crate::tree::HashSlot;

    #[tokio::test]
    async fn materialize_empty_slot_skips_extraction() {
        let mut tree = Tree::new();
        let file = tree.mknod(tree.root(), "f").unwrap();
        let lookup_table = LookupTable::new();
        let cwd = tempfile::tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();
        let codec = InMemoryArchiveCodec::new();

        let hash = materialize(&mut tree, &lookup_table, &staging, &codec, file, HashSlot::Primary, 0).await.unwrap();
        assert!(lookup_table.contains(&hash).await);
        assert_eq!(tree.get(file).unwrap().primary_hash, hash);
    }

    #[tokio::test]
    async fn materialize_reuses_lte_when_sole_user() {
        let mut tree = Tree::new();
        let file = tree.mknod(tree.root(), "f").unwrap();
        let original_hash = ContentHash::random_ephemeral();
        tree.get_mut(file).unwrap().primary_hash = original_hash;

        let lookup_table = LookupTable::new();
        lookup_table
            .insert(LookupTableEntry {
                hash: original_hash,
                refcnt: 1,
                descriptors: crate::lookup_table::DescriptorVector::new(),
                original_size: 5,
                archive_resource: Some(ArchiveResource { offset: 0, size_in_archive: 5, compressed: false }),
                staging_file_name: None,
            })
            .await;

        let codec = InMemoryArchiveCodec::new();
        codec.seed(original_hash, b"hello".to_vec()).await;

        let cwd = tempfile::tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();

        let new_hash = materialize(&mut tree, &lookup_table, &staging, &codec, file, HashSlot::Primary, 5).await.unwrap();
        assert!(!lookup_table.contains(&original_hash).await);
        assert!(lookup_table.contains(&new_hash).await);
    }

    /// Spec §8 scenario "Hard-link group share": two real hard-link peers
    /// (`link_group_size == old_lte.refcnt`, the "reuse" branch) both
    /// referencing one archive-backed LTE. Materializing through one peer
    /// must update the *other* peer's denormalized hash slot too, since
    /// there is no shared pointer between them — only a matching hash value.
    #[tokio::test]
    async fn materialize_reuse_propagates_new_hash_to_hard_link_peer() {
        let mut tree = Tree::new();
        let a = tree.mknod(tree.root(), "a").unwrap();
        let original_hash = ContentHash::random_ephemeral();
        tree.get_mut(a).unwrap().primary_hash = original_hash;
        let (b, _) = tree.link(a, tree.root(), "b").unwrap();
        assert_eq!(tree.hard_link_group_size(tree.get(a).unwrap().hard_link_group), 2);

        let lookup_table = LookupTable::new();
        lookup_table
            .insert(LookupTableEntry {
                hash: original_hash,
                refcnt: 2,
                descriptors: crate::lookup_table::DescriptorVector::new(),
                original_size: 5,
                archive_resource: Some(ArchiveResource { offset: 0, size_in_archive: 5, compressed: false }),
                staging_file_name: None,
            })
            .await;
        let codec = InMemoryArchiveCodec::new();
        codec.seed(original_hash, b"hello".to_vec()).await;

        let cwd = tempfile::tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();

        let new_hash = materialize(&mut tree, &lookup_table, &staging, &codec, a, HashSlot::Primary, 5).await.unwrap();

        assert_eq!(tree.get(a).unwrap().primary_hash, new_hash);
        assert_eq!(tree.get(b).unwrap().primary_hash, new_hash, "hard-link peer must track the new staged LTE");
        assert_eq!(lookup_table.with_mut(&new_hash, |lte| lte.refcnt).await, Some(2));
    }
}
