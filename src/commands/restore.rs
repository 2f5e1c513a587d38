use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use gletscher_core::catalog::CatalogEntry;
use gletscher_core::glacier::GlacierClient;
use gletscher_core::index::{Index, IndexEntry};
use gletscher_core::reconciler;
use regex::Regex;

use crate::config::Config;

const ARCHIVE_RETRIEVAL_POLL_INTERVAL: Duration = Duration::from_secs(900);
const ARCHIVE_RETRIEVAL_MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

pub async fn run(
    config: &Config,
    catalog_name: &str,
    patterns: &[String],
    output_dir: &Path,
) -> Result<()> {
    let catalog_path = config
        .find_latest_catalog(catalog_name)
        .with_context(|| format!("resolving catalog '{}'", catalog_name))?;
    let catalog = gletscher_core::Catalog::open(&catalog_path)
        .with_context(|| format!("opening catalog {}", catalog_path.display()))?;
    let index = Index::open(&config.index_dir()).context("opening index")?;
    let client = GlacierClient::new(
        &config.aws_region,
        &config.aws_account_id,
        &config.vault_name,
        &config.aws_access_key,
        &config.aws_secret_access_key,
    )?;
    let crypter = config.crypter();

    let regexes: Vec<Regex> = patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("compiling pattern {}", p)))
        .collect::<Result<_>>()?;
    let matches = catalog.matching(&regexes)?;
    if matches.is_empty() {
        bail!("no catalog entries matched the given patterns");
    }

    // Which archives (by tree hash) does this restore need, and which
    // index entries does each digest resolve to?
    let mut needed_tree_hashes: HashSet<String> = HashSet::new();
    let mut entries_by_digest: HashMap<[u8; 32], IndexEntry> = HashMap::new();
    for (_, entry) in &matches {
        if let CatalogEntry::File { digests, .. } = entry {
            for digest in digests {
                let index_entry = index
                    .get(digest)?
                    .with_context(|| format!("digest {} missing from index", hex::encode(digest)))?;
                needed_tree_hashes.insert(hex::encode(index_entry.file_tree_hash));
                entries_by_digest.insert(*digest, index_entry);
            }
        }
    }

    let inventory = reconciler::fetch_data_archive_inventory(
        config.uuid,
        &client,
        ARCHIVE_RETRIEVAL_POLL_INTERVAL,
        ARCHIVE_RETRIEVAL_MAX_WAIT,
    )
    .await
    .context("fetching vault inventory")?;
    let archive_id_by_tree_hash: HashMap<String, String> = inventory
        .into_iter()
        .map(|a| (a.tree_hash, a.archive_id))
        .collect();

    let mut job_id_by_tree_hash: HashMap<String, String> = HashMap::new();
    for tree_hash in &needed_tree_hashes {
        let archive_id = archive_id_by_tree_hash
            .get(tree_hash)
            .with_context(|| format!("archive with tree hash {} not found in vault inventory", tree_hash))?;
        let job_id = client.initiate_archive_retrieval(archive_id).await?;
        log::info!("requested retrieval of archive {} (job {})", archive_id, job_id);
        job_id_by_tree_hash.insert(tree_hash.clone(), job_id);
    }

    wait_for_jobs(&client, job_id_by_tree_hash.values()).await?;

    std::fs::create_dir_all(output_dir)?;
    let mut files_restored = 0u64;
    for (path, entry) in &matches {
        let relative = String::from_utf8_lossy(path);
        let relative = relative.trim_start_matches('/');
        let destination = output_dir.join(relative);

        match entry {
            CatalogEntry::Directory(_) => {
                std::fs::create_dir_all(&destination)?;
            }
            CatalogEntry::Link { target, .. } => {
                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let target_path = PathBuf::from(String::from_utf8_lossy(target).into_owned());
                let _ = std::fs::remove_file(&destination);
                std::os::unix::fs::symlink(target_path, &destination)?;
            }
            CatalogEntry::File { digests, .. } => {
                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut output = std::fs::File::create(&destination)?;
                for digest in digests {
                    let index_entry = &entries_by_digest[digest];
                    let tree_hash = hex::encode(index_entry.file_tree_hash);
                    let job_id = &job_id_by_tree_hash[&tree_hash];
                    let range = (
                        index_entry.offset,
                        index_entry.offset + index_entry.persisted_length as u64 - 1,
                    );
                    let encrypted = client.get_job_output(job_id, Some(range)).await?;
                    let plaintext =
                        crypter.decrypt_chunk(index_entry.storage_version, digest, &encrypted)?;
                    use std::io::Write;
                    output.write_all(&plaintext)?;
                }
                files_restored += 1;
            }
        }
    }

    log::info!(
        "restore from catalog '{}' complete: {} files written",
        catalog_name,
        files_restored
    );
    println!("restored {} matching entries to {}", matches.len(), output_dir.display());
    Ok(())
}

async fn wait_for_jobs<'a>(
    client: &GlacierClient,
    job_ids: impl Iterator<Item = &'a String>,
) -> Result<()> {
    let mut pending: HashSet<String> = job_ids.cloned().collect();
    let deadline = std::time::Instant::now() + ARCHIVE_RETRIEVAL_MAX_WAIT;

    while !pending.is_empty() {
        let jobs = client.list_jobs().await?;
        for job in &jobs {
            if pending.contains(&job.job_id) && job.completed_successfully() {
                pending.remove(&job.job_id);
            } else if pending.contains(&job.job_id) && job.completed && !job.completed_successfully() {
                bail!("archive retrieval job {} failed", job.job_id);
            }
        }
        if pending.is_empty() {
            break;
        }
        if std::time::Instant::now() >= deadline {
            bail!("timed out waiting for archive retrieval jobs to complete");
        }
        tokio::time::sleep(ARCHIVE_RETRIEVAL_POLL_INTERVAL).await;
    }
    Ok(())
}
