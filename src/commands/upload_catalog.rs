use anyhow::{Context, Result};
use gletscher_core::catalog::{Catalog, CatalogEntry};
use gletscher_core::glacier::GlacierClient;
use gletscher_core::index::Index;
use gletscher_core::kvpack::{self, KvFile};

use crate::config::Config;

const INDEX_FILE_NAME: &str = "index";

pub async fn run(config: &Config) -> Result<()> {
    let index = Index::open(&config.index_dir()).context("opening index")?;
    let mut files = Vec::new();

    let mut index_pairs = Vec::new();
    for result in index.entries() {
        let (digest, entry) = result?;
        index_pairs.push((digest.to_vec(), entry.serialize().to_vec()));
    }
    files.push(KvFile {
        name: INDEX_FILE_NAME.to_string(),
        pairs: index_pairs,
    });

    if config.catalog_dir().is_dir() {
        for entry in std::fs::read_dir(config.catalog_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let backup_id = entry.file_name().to_string_lossy().to_string();
            let catalog = Catalog::open(&entry.path())
                .with_context(|| format!("opening catalog {}", backup_id))?;
            let mut pairs = Vec::new();
            for result in catalog.entries() {
                let (path, catalog_entry): (Vec<u8>, CatalogEntry) = result?;
                pairs.push((path, catalog_entry.serialize()));
            }
            files.push(KvFile {
                name: backup_id,
                pairs,
            });
        }
    }

    let crypter = config.crypter();
    let packed = kvpack::pack(&crypter, &files);

    let client = GlacierClient::new(
        &config.aws_region,
        &config.aws_account_id,
        &config.vault_name,
        &config.aws_access_key,
        &config.aws_secret_access_key,
    )?;
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let description = serde_json::json!({
        "backup": config.uuid.to_string(),
        "type": "catalog",
        "name": timestamp,
    })
    .to_string();
    let archive_id = client.upload_archive(&description, packed).await?;

    log::info!("uploaded kv-pack with {} files as archive {}", files.len(), archive_id);
    println!("{}", archive_id);
    Ok(())
}
