//! The Commit Engine (spec §4.5): runs once, from the unmount destroy
//! callback, to fold every staged resource back into the archive.
//!
//! Grounded on `original_source/src/mount.c`'s `rebuild_wim` and
//! `calculate_sha1sum_for_staging_file`.

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::WimFsResult;
use crate::lookup_table::{ContentHash, LookupTable};
use crate::ops::WimFs;

/// Outcome of a commit attempt (spec §4.5 step 5: "final status is the
/// first non-zero of (rewrite, staging-removal)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStatus {
    pub rewrite_failed: bool,
    pub staging_removal_failed: bool,
}

impl CommitStatus {
    pub fn is_success(&self) -> bool {
        !self.rewrite_failed && !self.staging_removal_failed
    }

    /// The single status byte sent back over the handshake (spec §4.6):
    /// `0` on success, nonzero otherwise.
    pub fn to_byte(self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Runs the five-step commit sequence (spec §4.5). Only called when the
/// handshake decision was `commit = true` on a read-write mount.
pub async fn run(fs: &WimFs, check_integrity: bool) -> WimFsResult<CommitStatus> {
    quiesce_staged_fds(fs).await;
    rehash_and_dedupe(fs).await?;

    let (file_count, total_bytes) = count_tree(fs).await;
    fs.codec().update_image_metadata(fs.image_index(), file_count, total_bytes).await.ok();

    let rewrite_failed = fs.codec().rewrite_archive(check_integrity).await.is_err();
    if rewrite_failed {
        warn!("archive rewrite failed during commit");
    }

    let staging_removal_failed = fs.staging().destroy_all().await.is_err();
    if staging_removal_failed {
        warn!("staging directory removal failed during commit");
    }

    debug!(rewrite_failed, staging_removal_failed, "commit finished");
    Ok(CommitStatus { rewrite_failed, staging_removal_failed })
}

/// Step 1: close every kernel fd still open against a staged LTE. The mount
/// is torn down by the time commit runs, so no handler can still be holding
/// one of these open — this just ensures nothing is leaked into the
/// rewritten archive with a dangling descriptor.
async fn quiesce_staged_fds(fs: &WimFs) {
    let tree = fs.tree().lock().await;
    for id in tree.all_ids() {
        let Some(entry) = tree.get(id) else { continue };
        for slot in entry.all_slots() {
            let hash = entry.hash_slot(slot);
            if hash.is_zero() {
                continue;
            }
            fs.lookup_table()
                .with_mut(&hash, |lte| {
                    let ids: Vec<u64> = lte.descriptors.ids();
                    for fh_id in ids {
                        if let Some(slot) = lte.descriptors.find_by_id(fh_id) {
                            lte.descriptors.close(slot);
                        }
                    }
                })
                .await;
        }
    }
}

/// Step 2: for every staged LTE, recompute its real content hash from the
/// staging file's bytes and re-index it. A new hash that collides with an
/// existing (already-archived or already-rehashed) LTE is deduped: the new
/// LTE is discarded, the existing one's refcount absorbs it, and every DE
/// slot that pointed at the ephemeral hash is rewritten to the real one.
async fn rehash_and_dedupe(fs: &WimFs) -> WimFsResult<()> {
    let slots_by_hash = {
        let tree = fs.tree().lock().await;
        let mut pending = Vec::new();
        for id in tree.all_ids() {
            let Some(entry) = tree.get(id) else { continue };
            for slot in entry.all_slots() {
                let hash = entry.hash_slot(slot);
                if !hash.is_zero() {
                    pending.push((id, slot, hash));
                }
            }
        }
        pending
    };

    let mut rehashed: std::collections::HashMap<ContentHash, ContentHash> = std::collections::HashMap::new();

    for (dentry, slot, ephemeral_hash) in &slots_by_hash {
        if rehashed.contains_key(ephemeral_hash) {
            continue;
        }
        let is_staged = fs.lookup_table().with_mut(ephemeral_hash, |lte| lte.is_staged()).await.unwrap_or(false);
        if !is_staged {
            continue;
        }
        let real_hash = sha1_of_staging_file(fs.lookup_table(), *ephemeral_hash).await?;
        rehashed.insert(*ephemeral_hash, real_hash);

        let already_exists = *ephemeral_hash != real_hash && fs.lookup_table().contains(&real_hash).await;
        if already_exists {
            if let Some(mut lte) = fs.lookup_table().remove(ephemeral_hash).await {
                fs.lookup_table().with_mut(&real_hash, |existing| existing.refcnt += lte.refcnt).await;
                if let Some(path) = lte.staging_file_name.take() {
                    tokio::fs::remove_file(&path).await.ok();
                }
            }
        } else if let Some(mut lte) = fs.lookup_table().remove(ephemeral_hash).await {
            lte.hash = real_hash;
            fs.lookup_table().insert(lte).await;
        }

        let _ = (dentry, slot);
    }

    if !rehashed.is_empty() {
        let mut tree = fs.tree().lock().await;
        for id in tree.all_ids() {
            let Some(entry) = tree.get_mut(id) else { continue };
            for slot in entry.all_slots() {
                let hash = entry.hash_slot(slot);
                if let Some(&real_hash) = rehashed.get(&hash) {
                    entry.set_hash_slot(slot, real_hash);
                }
            }
        }
    }

    Ok(())
}

async fn sha1_of_staging_file(lookup_table: &LookupTable, hash: ContentHash) -> WimFsResult<ContentHash> {
    let path = lookup_table.with_mut(&hash, |lte| lte.staging_file_name.clone()).await.flatten();
    let Some(path) = path else {
        return Ok(hash);
    };
    let bytes = tokio::fs::read(&path).await.map_err(crate::error::WimFsError::from)?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    Ok(ContentHash(out))
}

/// File/byte counts fed to the codec's image-metadata update (spec §4.5
/// step 3); a plain DE walk, not a performance-sensitive path.
async fn count_tree(fs: &WimFs) -> (u64, u64) {
    let tree = fs.tree().lock().await;
    let mut file_count = 0u64;
    let mut total_bytes = 0u64;
    for id in tree.all_ids() {
        let Some(entry) = tree.get(id) else { continue };
        if entry.attributes.directory {
            continue;
        }
        file_count += 1;
        for slot in entry.all_slots() {
            let hash = entry.hash_slot(slot);
            if hash.is_zero() {
                continue;
            }
            total_bytes += fs.lookup_table().with_mut(&hash, |lte| lte.original_size).await.unwrap_or(0);
        }
    }
    (file_count, total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InMemoryArchiveCodec;
    use crate::config::MountConfig;
    use crate::staging::StagingStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn commit_rehashes_staged_resource_and_rewrites_once() {
        let cwd = tempfile::tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();
        let codec = Arc::new(InMemoryArchiveCodec::new());
        let fs = WimFs::new(codec.clone(), staging, MountConfig { read_write: true, ..Default::default() }, 1);

        let root = fs.root_ino();
        let (ino, fh) = fs.create(root, "a.txt").await.unwrap();
        fs.write(fh, 0, b"hello").await.unwrap();
        fs.release(fh, ino).await.unwrap();

        let status = run(&fs, false).await.unwrap();
        assert!(status.is_success());
        assert_eq!(codec.rewrite_count().await, 1);
    }

    #[tokio::test]
    async fn commit_dedupes_two_files_with_identical_content() {
        let cwd = tempfile::tempdir().unwrap();
        let staging = StagingStore::create_under(cwd.path()).await.unwrap();
        let codec = Arc::new(InMemoryArchiveCodec::new());
        let fs = WimFs::new(codec.clone(), staging, MountConfig { read_write: true, ..Default::default() }, 1);

        let root = fs.root_ino();
        let (ino_a, fh_a) = fs.create(root, "a.txt").await.unwrap();
        fs.write(fh_a, 0, b"same-bytes").await.unwrap();
        fs.release(fh_a, ino_a).await.unwrap();

        let (ino_b, fh_b) = fs.create(root, "b.txt").await.unwrap();
        fs.write(fh_b, 0, b"same-bytes").await.unwrap();
        fs.release(fh_b, ino_b).await.unwrap();

        run(&fs, false).await.unwrap();

        let tree = fs.tree().lock().await;
        let a = tree.get(crate::tree::DirEntryId(ino_a)).unwrap().primary_hash;
        let b = tree.get(crate::tree::DirEntryId(ino_b)).unwrap().primary_hash;
        assert_eq!(a, b);
    }
}
