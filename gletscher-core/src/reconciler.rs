//! Cross-checks between the three things that are supposed to agree: the
//! catalog (what a backup run says it wrote), the index (what chunks this
//! backup key has ever produced and where they live), and the vault's own
//! inventory (what the cold store actually still has).
//!
//! These are independent checks, not one invariant: a catalog can reference
//! a digest the index has simply never heard of (corruption or a bug in the
//! backup run that wrote it), and the index can reference a tree hash the
//! vault inventory no longer lists (an archive deleted outside this tool,
//! or a vault recovered from a stale inventory snapshot).

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::Error;
use crate::glacier::GlacierClient;
use crate::index::Index;

/// Default interval between inventory-retrieval job polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(900);
/// An inventory older than this is no longer trusted as "recent".
pub const MAX_INVENTORY_AGE: Duration = Duration::from_secs(30 * 3600);

/// Walk every regular file in `catalog` and confirm every digest it
/// references both (a) has an entry in `index` and (b) resolves to an
/// archive tree hash that is not in `missing_tree_hashes` (archives the
/// Index↔Inventory check has already determined the vault no longer has).
/// Returns the full list of affected paths rather than failing on the
/// first one, so an operator sees the whole blast radius of a deleted
/// archive in one report.
pub fn find_paths_missing_data(
    catalog: &Catalog,
    index: &Index,
    missing_tree_hashes: &HashSet<[u8; 32]>,
) -> Result<Vec<Vec<u8>>, Error> {
    let mut affected = Vec::new();

    for result in catalog.entries() {
        let (path, entry) = result?;
        if let CatalogEntry::File { digests, .. } = entry {
            let mut path_is_affected = false;
            for digest in &digests {
                match index.get(&digest)? {
                    None => path_is_affected = true,
                    Some(index_entry) if missing_tree_hashes.contains(&index_entry.file_tree_hash) => {
                        path_is_affected = true;
                    }
                    Some(_) => {}
                }
            }
            if path_is_affected {
                affected.push(path);
            }
        }
    }

    Ok(affected)
}

/// Confirm every digest referenced by `catalog` is backed by live data.
/// Convenience wrapper around [`find_paths_missing_data`] for callers that
/// don't need the Index↔Inventory cross-reference (e.g. a standalone
/// catalog sanity check with an empty `missing_tree_hashes` set).
pub fn assert_catalog_digests_present(catalog: &Catalog, index: &Index) -> Result<(), Error> {
    let affected = find_paths_missing_data(catalog, index, &HashSet::new())?;
    if !affected.is_empty() {
        return Err(Error::DataMissing(format!(
            "{} path(s) reference digests missing from the index, e.g. {}",
            affected.len(),
            String::from_utf8_lossy(&affected[0])
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
struct InventoryArchive {
    #[serde(rename = "ArchiveId")]
    archive_id: String,
    #[serde(rename = "SHA256TreeHash")]
    sha256_tree_hash: String,
    #[serde(rename = "ArchiveDescription")]
    archive_description: String,
}

#[derive(Deserialize)]
struct Inventory {
    #[serde(rename = "ArchiveList")]
    archive_list: Vec<InventoryArchive>,
}

#[derive(Deserialize)]
struct ArchiveDescription {
    backup: String,
    #[serde(rename = "type")]
    kind: String,
}

/// One data archive belonging to `backup_id`, as reported by the vault's
/// own inventory.
#[derive(Debug, Clone)]
pub struct InventoriedArchive {
    pub archive_id: String,
    pub tree_hash: String,
}

/// Fetch the most recently completed inventory for this vault, requesting
/// (and waiting for) a fresh one if none is available or already in
/// flight. Returns only the data archives tagged with `backup_id`.
pub async fn fetch_data_archive_inventory(
    backup_id: Uuid,
    client: &GlacierClient,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<Vec<InventoriedArchive>, Error> {
    let deadline = std::time::Instant::now() + max_wait;
    let mut requested_job: Option<String> = None;

    loop {
        let jobs = client.list_jobs().await?;
        let recent_completed = jobs
            .iter()
            .filter(|j| j.is_inventory_retrieval() && j.completed_successfully())
            .max_by_key(|j| j.completion_date.clone());

        if let Some(job) = recent_completed {
            let body = client.get_job_output(&job.job_id, None).await?;
            let inventory: Inventory = serde_json::from_slice(&body)?;
            let archives = inventory
                .archive_list
                .into_iter()
                .filter_map(|a| {
                    let desc: ArchiveDescription = serde_json::from_str(&a.archive_description).ok()?;
                    if desc.kind == "data" && desc.backup == backup_id.to_string() {
                        Some(InventoriedArchive {
                            archive_id: a.archive_id,
                            tree_hash: a.sha256_tree_hash.to_lowercase(),
                        })
                    } else {
                        None
                    }
                })
                .collect();
            return Ok(archives);
        }

        if requested_job.is_none() {
            let pending = jobs.iter().any(|j| j.is_inventory_retrieval() && j.is_pending());
            if !pending {
                let job_id = client.initiate_inventory_retrieval().await?;
                log::info!("requested fresh vault inventory, job id {}", job_id);
                requested_job = Some(job_id);
            }
        }

        if std::time::Instant::now() >= deadline {
            return Err(Error::DataMissing(
                "timed out waiting for a vault inventory to reconcile against".into(),
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Compute the set of archive tree hashes referenced by `index` that the
/// vault's own inventory does not (or no longer) list as a `data` archive
/// for `backup_id`. Requests a fresh inventory if none recent enough is
/// available or in flight, and polls every `poll_interval` (capped at
/// `max_wait`) until one completes. An empty result means the index is
/// fully backed by live archives.
pub async fn missing_tree_hashes(
    backup_id: Uuid,
    index: &Index,
    client: &GlacierClient,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<HashSet<[u8; 32]>, Error> {
    let archives = fetch_data_archive_inventory(backup_id, client, poll_interval, max_wait).await?;
    let available: HashSet<String> = archives.into_iter().map(|a| a.tree_hash).collect();

    let mut missing = HashSet::new();
    for result in index.entries() {
        let (_, entry) = result?;
        if !available.contains(&hex::encode(entry.file_tree_hash)) {
            missing.insert(entry.file_tree_hash);
        }
    }
    Ok(missing)
}

/// Confirm every index entry's archive tree hash is backed by a data
/// archive the vault inventory still lists for `backup_id`.
pub async fn assert_index_backed_by_inventory(
    backup_id: Uuid,
    index: &Index,
    client: &GlacierClient,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<(), Error> {
    let missing = missing_tree_hashes(backup_id, index, client, poll_interval, max_wait).await?;
    if let Some(tree_hash) = missing.iter().next() {
        return Err(Error::DataMissing(format!(
            "archive tree hash {} not found in vault inventory ({} total missing)",
            hex::encode(tree_hash),
            missing.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Stat;

    fn stat() -> Stat {
        Stat {
            mode: 0o100644,
            size: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn catalog_digests_present_passes_when_index_has_everything() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();

        let digest = [5u8; 32];
        catalog
            .add_file(std::path::Path::new("/a"), stat(), vec![digest], 0)
            .unwrap();
        index
            .add(
                &digest,
                &crate::index::IndexEntry {
                    file_tree_hash: [1u8; 32],
                    storage_version: 2,
                    offset: 0,
                    persisted_length: 1,
                    original_length: 1,
                },
            )
            .unwrap();

        assert!(assert_catalog_digests_present(&catalog, &index).is_ok());
    }

    #[test]
    fn catalog_digests_present_fails_on_missing_digest() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();

        catalog
            .add_file(std::path::Path::new("/a"), stat(), vec![[9u8; 32]], 0)
            .unwrap();

        let err = assert_catalog_digests_present(&catalog, &index).unwrap_err();
        assert!(matches!(err, Error::DataMissing(_)));
    }

    #[test]
    fn find_paths_missing_data_reports_exactly_the_paths_behind_a_deleted_archive() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();

        let deleted_archive = [1u8; 32];
        let live_archive = [2u8; 32];
        let digest_in_deleted = [10u8; 32];
        let digest_in_live = [11u8; 32];

        catalog
            .add_file(
                std::path::Path::new("/a/affected"),
                stat(),
                vec![digest_in_deleted],
                0,
            )
            .unwrap();
        catalog
            .add_file(std::path::Path::new("/a/safe"), stat(), vec![digest_in_live], 0)
            .unwrap();
        index
            .add(
                &digest_in_deleted,
                &crate::index::IndexEntry {
                    file_tree_hash: deleted_archive,
                    storage_version: 2,
                    offset: 0,
                    persisted_length: 1,
                    original_length: 1,
                },
            )
            .unwrap();
        index
            .add(
                &digest_in_live,
                &crate::index::IndexEntry {
                    file_tree_hash: live_archive,
                    storage_version: 2,
                    offset: 0,
                    persisted_length: 1,
                    original_length: 1,
                },
            )
            .unwrap();

        let mut missing = HashSet::new();
        missing.insert(deleted_archive);

        let affected = find_paths_missing_data(&catalog, &index, &missing).unwrap();
        assert_eq!(affected, vec![b"/a/affected".to_vec()]);
    }
}
