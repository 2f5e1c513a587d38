//! On-disk backup configuration: the secret key, AWS/Glacier credentials
//! and tunables for one backup identity, stored as a small ini-style text
//! file under the config directory.
//!
//! The config file is not a secrets vault — it is meant to live on the
//! machine taking backups, readable only by its owner. Its one piece of
//! tamper-evidence is `signature`, an HMAC of the backup's uuid keyed by
//! its own secret key, checked on every load so that a config file copied
//! across two different secret keys (or hand-edited) is caught early
//! rather than silently producing an index nobody can read back.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use gletscher_core::Crypter;
use uuid::Uuid;

const DEFAULT_MAX_CHUNK_SIZE: usize = gletscher_core::chunker::DEFAULT_MAX_CHUNK_SIZE;
const DEFAULT_MAX_DATA_FILE_SIZE: u64 = gletscher_core::chunk_streamer::DEFAULT_MAX_ARCHIVE_SIZE;
const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = gletscher_core::uploader::DEFAULT_BLOCK_SIZE;

pub struct Config {
    pub config_dir: PathBuf,
    pub uuid: Uuid,
    pub secret_key: [u8; 32],
    pub aws_region: String,
    pub aws_account_id: String,
    pub vault_name: String,
    pub aws_access_key: String,
    pub aws_secret_access_key: String,
    pub max_chunk_size: usize,
    pub max_data_file_size: u64,
    pub upload_chunk_size: u64,
}

impl Config {
    pub fn index_dir(&self) -> PathBuf {
        self.config_dir.join("index")
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.config_dir.join("catalogs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.config_dir.join("tmp")
    }

    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("log.txt")
    }

    /// Path of the `_global` catalog, which accumulates the most recent
    /// observation of every path across all backup runs and drives the
    /// "has this file changed?" test.
    pub fn global_catalog_path(&self) -> PathBuf {
        self.catalog_dir().join("_global")
    }

    /// Path of one run's named catalog snapshot: `<name>-<UTC timestamp>`.
    pub fn run_catalog_path(&self, name: &str, utc_timestamp: &str) -> PathBuf {
        self.catalog_dir().join(format!("{}-{}", name, utc_timestamp))
    }

    /// Locate the most recently modified catalog snapshot whose directory
    /// name starts with `<name>-`, used by `restore` and `search_catalog`
    /// to resolve an operator-given catalog name to an actual run.
    pub fn find_latest_catalog(&self, name: &str) -> Result<PathBuf> {
        let prefix = format!("{}-", name);
        let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(self.catalog_dir())
            .with_context(|| format!("reading {}", self.catalog_dir().display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(&prefix) {
                candidates.push((entry.metadata()?.modified()?, entry.path()));
            }
        }
        candidates.sort_by_key(|(modified, _)| *modified);
        candidates
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| anyhow!("no catalog snapshot found for name '{}'", name))
    }

    fn ini_path(config_dir: &Path) -> PathBuf {
        config_dir.join("backup.config")
    }

    pub fn crypter(&self) -> Crypter {
        Crypter::new(self.secret_key)
    }

    /// Load an existing configuration, verifying its signature.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(Self::ini_path(config_dir))
            .with_context(|| format!("reading {}", Self::ini_path(config_dir).display()))?;
        let sections = parse_ini(&text)?;

        let uuid_str = get(&sections, "id", "uuid")?;
        let uuid = Uuid::parse_str(uuid_str).context("parsing uuid")?;
        let secret_key_hex = get(&sections, "id", "key")?;
        let secret_key = decode_key(secret_key_hex)?;
        let signature_hex = get(&sections, "id", "signature")?;
        let signature = hex::decode(signature_hex).context("decoding signature")?;

        let crypter = Crypter::new(secret_key);
        let expected = crypter.hash(uuid.as_bytes());
        if expected.as_slice() != signature.as_slice() {
            bail!("config signature does not match secret_key/uuid; config file may be corrupt or mismatched");
        }

        let config = Config {
            config_dir: config_dir.to_path_buf(),
            uuid,
            secret_key,
            aws_region: get(&sections, "aws", "region")?.to_string(),
            aws_account_id: get(&sections, "aws", "account_id")?.to_string(),
            vault_name: get(&sections, "glacier", "vault_name")?.to_string(),
            aws_access_key: get(&sections, "aws", "access_key")?.to_string(),
            aws_secret_access_key: get(&sections, "aws", "secret_access_key")?.to_string(),
            max_chunk_size: get_opt(&sections, "scanning", "max_chunk_size")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(DEFAULT_MAX_CHUNK_SIZE),
            max_data_file_size: get_opt(&sections, "scanning", "max_data_file_size")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(DEFAULT_MAX_DATA_FILE_SIZE),
            upload_chunk_size: get_opt(&sections, "glacier", "upload_chunk_size")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(DEFAULT_UPLOAD_CHUNK_SIZE),
        };

        for dir in [config.index_dir(), config.catalog_dir(), config.tmp_dir()] {
            if !dir.is_dir() {
                bail!("expected directory {} does not exist", dir.display());
            }
        }

        Ok(config)
    }

    /// Create a brand-new configuration, prompting for AWS/Glacier fields
    /// via `prompt` (so the CLI layer can decide between stdin prompts and
    /// a non-interactive source in tests).
    pub fn init(config_dir: &Path, prompt: &mut dyn FnMut(&str) -> Result<String>) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;

        let uuid = Uuid::new_v4();
        let mut secret_key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret_key);
        let crypter = Crypter::new(secret_key);
        let signature = crypter.hash(uuid.as_bytes());

        let config = Config {
            config_dir: config_dir.to_path_buf(),
            uuid,
            secret_key,
            aws_region: prompt("AWS region (e.g. us-east-1)")?,
            aws_account_id: prompt("AWS account id")?,
            vault_name: prompt("Glacier vault name")?,
            aws_access_key: prompt("AWS access key id")?,
            aws_secret_access_key: prompt("AWS secret access key")?,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_data_file_size: DEFAULT_MAX_DATA_FILE_SIZE,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        };

        std::fs::create_dir_all(config.index_dir())?;
        std::fs::create_dir_all(config.catalog_dir())?;
        std::fs::create_dir_all(config.tmp_dir())?;

        let text = config.render_ini(&signature);
        std::fs::write(Self::ini_path(config_dir), text)?;

        Ok(config)
    }

    fn render_ini(&self, signature: &[u8; 32]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[id]");
        let _ = writeln!(out, "uuid = {}", self.uuid);
        let _ = writeln!(out, "key = {}", hex::encode(self.secret_key));
        let _ = writeln!(out, "signature = {}", hex::encode(signature));
        let _ = writeln!(out);
        let _ = writeln!(out, "[aws]");
        let _ = writeln!(out, "region = {}", self.aws_region);
        let _ = writeln!(out, "account_id = {}", self.aws_account_id);
        let _ = writeln!(out, "access_key = {}", self.aws_access_key);
        let _ = writeln!(out, "secret_access_key = {}", self.aws_secret_access_key);
        let _ = writeln!(out);
        let _ = writeln!(out, "[glacier]");
        let _ = writeln!(out, "vault_name = {}", self.vault_name);
        let _ = writeln!(out, "upload_chunk_size = {}", self.upload_chunk_size);
        let _ = writeln!(out);
        let _ = writeln!(out, "[scanning]");
        let _ = writeln!(out, "max_chunk_size = {}", self.max_chunk_size);
        let _ = writeln!(out, "max_data_file_size = {}", self.max_data_file_size);
        out
    }
}

fn decode_key(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decoding secret_key")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("secret_key must be exactly 32 bytes"))
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

fn parse_ini(text: &str) -> Result<Sections> {
    let mut sections: Sections = BTreeMap::new();
    let mut current = String::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            current = name.trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("backup.config:{}: expected `key = value`", lineno + 1))?;
        if current.is_empty() {
            bail!("backup.config:{}: key outside of any [section]", lineno + 1);
        }
        sections
            .entry(current.clone())
            .or_default()
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}

fn get<'a>(sections: &'a Sections, section: &str, key: &str) -> Result<&'a str> {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("backup.config: missing [{}] {}", section, key))
}

fn get_opt<'a>(sections: &'a Sections, section: &str, key: &str) -> Option<&'a str> {
    sections.get(section).and_then(|s| s.get(key)).map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_keys() {
        let text = "[id]\nuuid = abc\n\n[aws]\nregion = us-east-1\n";
        let sections = parse_ini(text).unwrap();
        assert_eq!(get(&sections, "id", "uuid").unwrap(), "abc");
        assert_eq!(get(&sections, "aws", "region").unwrap(), "us-east-1");
    }

    #[test]
    fn rejects_key_outside_section() {
        let text = "uuid = abc\n";
        assert!(parse_ini(text).is_err());
    }

    #[test]
    fn init_then_load_round_trips_and_verifies_signature() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("cfg");
        let mut answers = vec![
            "us-west-2".to_string(),
            "123456789012".to_string(),
            "my-vault".to_string(),
            "AKIA...".to_string(),
            "secret...".to_string(),
        ]
        .into_iter();
        let mut prompt = move |_: &str| Ok(answers.next().unwrap());

        let created = Config::init(&config_dir, &mut prompt).unwrap();
        let loaded = Config::load(&config_dir).unwrap();
        assert_eq!(created.uuid, loaded.uuid);
        assert_eq!(created.secret_key, loaded.secret_key);
        assert_eq!(loaded.aws_region, "us-west-2");
        assert_eq!(loaded.vault_name, "my-vault");
    }

    #[test]
    fn load_rejects_tampered_signature() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("cfg");
        let mut answers = vec!["r", "a", "v", "k", "s"].into_iter().map(String::from);
        let mut prompt = move |_: &str| Ok(answers.next().unwrap());
        Config::init(&config_dir, &mut prompt).unwrap();

        let ini_path = Config::ini_path(&config_dir);
        let text = std::fs::read_to_string(&ini_path).unwrap();
        let signature_line = text
            .lines()
            .find(|l| l.starts_with("signature = "))
            .unwrap()
            .to_string();
        let value = signature_line.strip_prefix("signature = ").unwrap();
        let flipped_char = if value.starts_with('f') { '0' } else { 'f' };
        let mut corrupted_value = value.to_string();
        corrupted_value.replace_range(0..1, &flipped_char.to_string());
        let tampered = text.replacen(&signature_line, &format!("signature = {}", corrupted_value), 1);
        std::fs::write(&ini_path, tampered).unwrap();

        assert!(Config::load(&config_dir).is_err());
    }
}
