//! Administrative command sharing `restore`'s path-matching step without
//! touching the cold store: lists what a restore *would* act on.

use anyhow::{Context, Result};
use gletscher_core::catalog::CatalogEntry;
use regex::Regex;

use crate::config::Config;

pub fn run(config: &Config, catalog_name: &str, patterns: &[String]) -> Result<()> {
    let catalog_path = config
        .find_latest_catalog(catalog_name)
        .with_context(|| format!("resolving catalog '{}'", catalog_name))?;
    let catalog = gletscher_core::Catalog::open(&catalog_path)
        .with_context(|| format!("opening catalog {}", catalog_path.display()))?;

    let regexes: Vec<Regex> = patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("compiling pattern {}", p)))
        .collect::<Result<_>>()?;
    let matches = catalog.matching(&regexes)?;

    for (path, entry) in &matches {
        let rendered = String::from_utf8_lossy(path);
        match entry {
            CatalogEntry::Directory(stat) => {
                println!("d {:>12} {}", stat.size, rendered);
            }
            CatalogEntry::Link { stat, target } => {
                println!(
                    "l {:>12} {} -> {}",
                    stat.size,
                    rendered,
                    String::from_utf8_lossy(target)
                );
            }
            CatalogEntry::File { stat, digests } => {
                println!("f {:>12} {} ({} chunks)", stat.size, rendered, digests.len());
            }
        }
    }

    log::info!(
        "search of catalog '{}' matched {} entries",
        catalog_name,
        matches.len()
    );
    Ok(())
}
