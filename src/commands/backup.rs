use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use gletscher_core::catalog::{Catalog, CatalogEntry};
use gletscher_core::chunk_streamer::ChunkStreamer;
use gletscher_core::chunker::FileChunker;
use gletscher_core::glacier::GlacierClient;
use gletscher_core::index::Index;
use gletscher_core::uploader::StreamingUploader;

use crate::config::Config;
use crate::scanner::{self, ScannedEntry};

pub async fn run(
    config: &Config,
    catalog_name: &str,
    directories: &[PathBuf],
    excludes: &[String],
) -> Result<()> {
    let index = Index::open(&config.index_dir()).context("opening index")?;
    let global_catalog =
        Catalog::open(&config.global_catalog_path()).context("opening _global catalog")?;

    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let run_name = format!("{}-{}", catalog_name, timestamp);
    let run_catalog = Catalog::open(&config.catalog_dir().join(&run_name))
        .with_context(|| format!("opening catalog {}", run_name))?;

    let client = Arc::new(GlacierClient::new(
        &config.aws_region,
        &config.aws_account_id,
        &config.vault_name,
        &config.aws_access_key,
        &config.aws_secret_access_key,
    )?);
    let uploader = StreamingUploader::with_block_size(client, config.upload_chunk_size);
    let crypter = config.crypter();

    // `config.uuid` is the one backup identity drawn at `init` time; every
    // archive this (or any other) run produces is tagged with it so the
    // reconciler can partition the vault inventory by backup, not by run.
    let mut streamer = ChunkStreamer::new(&index, &uploader, &crypter, config.uuid)
        .with_limits(config.max_data_file_size, gletscher_core::chunk_streamer::DEFAULT_MAX_PENDING_DIGESTS);

    let mut files_scanned = 0u64;
    let mut files_reused = 0u64;
    let mut bytes_uploaded = 0u64;

    for directory in directories {
        let entries = scanner::scan(directory, excludes)
            .with_context(|| format!("scanning {}", directory.display()))?;
        for entry in entries {
            process_entry(
                &entry,
                &run_catalog,
                &global_catalog,
                &index,
                &mut streamer,
                &crypter,
                config.max_chunk_size,
                &mut files_scanned,
                &mut files_reused,
                &mut bytes_uploaded,
            )
            .await
            .with_context(|| format!("processing {}", entry.path.display()))?;
        }
    }

    streamer.finish().await.context("sealing final archive")?;
    run_catalog.flush()?;
    global_catalog.flush()?;
    index.flush()?;
    cleanup_tmp_dir(&config.tmp_dir())?;

    log::info!(
        "backup {} ({}) complete: {} files scanned, {} reused unchanged, {} bytes of new chunk data uploaded",
        config.uuid,
        run_name,
        files_scanned,
        files_reused,
        bytes_uploaded,
    );
    println!("{}", run_name);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_entry(
    entry: &ScannedEntry,
    run_catalog: &Catalog,
    global_catalog: &Catalog,
    index: &Index,
    streamer: &mut ChunkStreamer<'_>,
    crypter: &gletscher_core::Crypter,
    max_chunk_size: usize,
    files_scanned: &mut u64,
    files_reused: &mut u64,
    bytes_uploaded: &mut u64,
) -> Result<()> {
    *files_scanned += 1;

    if entry.stat.is_directory() {
        run_catalog.add(&entry.path, entry.stat, None)?;
        global_catalog.add(&entry.path, entry.stat, None)?;
        return Ok(());
    }
    if let Some(target) = &entry.link_target {
        run_catalog.add(&entry.path, entry.stat, Some(target.clone()))?;
        global_catalog.add(&entry.path, entry.stat, Some(target.clone()))?;
        return Ok(());
    }

    if let Some(existing) = global_catalog.find(&entry.path)? {
        if !existing.has_changed(&entry.stat) {
            let digests_present = match &existing {
                CatalogEntry::File { digests, .. } => {
                    let mut all_present = true;
                    for digest in digests {
                        if !index.contains(digest)? {
                            all_present = false;
                            break;
                        }
                    }
                    all_present
                }
                CatalogEntry::Directory(_) | CatalogEntry::Link { .. } => true,
            };
            if digests_present {
                run_catalog.transfer(&entry.path, &existing)?;
                *files_reused += 1;
                return Ok(());
            }
        }
    }

    let file = std::fs::File::open(&entry.path)?;
    let mut chunker = FileChunker::new(file, max_chunk_size);
    let mut digests = Vec::new();
    let mut total_length = 0u64;

    while let Some(chunk) = chunker.next_chunk()? {
        let digest = crypter.hash(&chunk);
        total_length += chunk.len() as u64;
        if streamer.upload(digest, &chunk).await? {
            *bytes_uploaded += chunk.len() as u64;
        }
        digests.push(digest);
    }

    run_catalog.add_file(&entry.path, entry.stat, digests.clone(), total_length)?;
    global_catalog.add_file(&entry.path, entry.stat, digests, total_length)?;
    Ok(())
}

fn cleanup_tmp_dir(tmp_dir: &Path) -> Result<()> {
    if !tmp_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(tmp_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
