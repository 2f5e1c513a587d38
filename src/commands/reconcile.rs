use std::time::Duration;

use anyhow::{Context, Result};
use gletscher_core::catalog::Catalog;
use gletscher_core::glacier::GlacierClient;
use gletscher_core::index::Index;
use gletscher_core::reconciler;

use crate::config::Config;

/// Runs both checks from the design: first Index↔Inventory (which archives
/// the vault no longer has), then Catalog↔Index against that result (which
/// paths that loss actually affects). Reports every affected path before
/// failing, rather than stopping at the first one, so an operator sees the
/// whole blast radius of a deleted archive in a single run.
pub async fn run(config: &Config, poll_interval_secs: u64, max_wait_secs: u64) -> Result<()> {
    let index = Index::open(&config.index_dir()).context("opening index")?;

    let client = GlacierClient::new(
        &config.aws_region,
        &config.aws_account_id,
        &config.vault_name,
        &config.aws_access_key,
        &config.aws_secret_access_key,
    )?;

    let missing_tree_hashes = reconciler::missing_tree_hashes(
        config.uuid,
        &index,
        &client,
        Duration::from_secs(poll_interval_secs),
        Duration::from_secs(max_wait_secs),
    )
    .await
    .context("reconciling index against vault inventory")?;

    let mut affected_paths = Vec::new();
    if config.catalog_dir().is_dir() {
        for entry in std::fs::read_dir(config.catalog_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let catalog_name = entry.file_name().to_string_lossy().to_string();
            let catalog = Catalog::open(&entry.path())
                .with_context(|| format!("opening catalog {}", catalog_name))?;
            let paths = reconciler::find_paths_missing_data(&catalog, &index, &missing_tree_hashes)
                .with_context(|| format!("reconciling catalog {} against index", catalog_name))?;
            for path in paths {
                affected_paths.push((catalog_name.clone(), path));
            }
        }
    }

    if !affected_paths.is_empty() {
        for (catalog_name, path) in &affected_paths {
            println!(
                "DATA MISSING: {} ({})",
                String::from_utf8_lossy(path),
                catalog_name
            );
        }
        return Err(gletscher_core::Error::DataMissing(format!(
            "{} path(s) across {} missing tree hash(es) have no recoverable archive",
            affected_paths.len(),
            missing_tree_hashes.len()
        ))
        .into());
    }

    println!("reconciliation passed");
    Ok(())
}
