//! The catalog: a persistent map from filesystem path to the metadata and
//! digest list needed to reconstruct it, as of one backup run.
//!
//! Every backup id gets its own catalog (sled database keyed by path), so a
//! later `restore` can walk exactly the tree a given run saw without
//! re-reading the filesystem.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use regex::Regex;
use sled::Db;

use crate::error::Error;

pub const CURRENT_CATALOG_VERSION: u8 = 1;

const MODE_FMT_MASK: u32 = 0o170000;
const MODE_FMT_DIR: u32 = 0o040000;
const MODE_FMT_LINK: u32 = 0o120000;

/// The subset of `stat(2)` fields the catalog tracks to decide whether a
/// file needs to be re-chunked on the next backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Stat {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            mode: metadata.mode(),
            size: metadata.size(),
            mtime: metadata.mtime() as u64,
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & MODE_FMT_MASK == MODE_FMT_DIR
    }

    pub fn is_link(&self) -> bool {
        self.mode & MODE_FMT_MASK == MODE_FMT_LINK
    }

    pub fn is_regular_file(&self) -> bool {
        !self.is_directory() && !self.is_link()
    }
}

/// One catalog record. Directories and symlinks carry only their stat;
/// regular files additionally carry the ordered list of chunk digests that
/// reconstruct their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEntry {
    Directory(Stat),
    Link { stat: Stat, target: Vec<u8> },
    File { stat: Stat, digests: Vec<[u8; 32]> },
}

impl CatalogEntry {
    pub fn stat(&self) -> &Stat {
        match self {
            CatalogEntry::Directory(stat) => stat,
            CatalogEntry::Link { stat, .. } => stat,
            CatalogEntry::File { stat, .. } => stat,
        }
    }

    /// True if `stat` differs in any field the catalog considers
    /// significant for re-chunking decisions.
    pub fn has_changed(&self, stat: &Stat) -> bool {
        self.stat() != stat
    }

    fn serialize_header(stat: &Stat, buf: &mut Vec<u8>) {
        buf.push(CURRENT_CATALOG_VERSION);
        buf.extend_from_slice(&stat.mode.to_be_bytes());
        buf.extend_from_slice(&stat.size.to_be_bytes());
        buf.extend_from_slice(&stat.mtime.to_be_bytes());
        buf.extend_from_slice(&stat.uid.to_be_bytes());
        buf.extend_from_slice(&stat.gid.to_be_bytes());
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            CatalogEntry::Directory(stat) => {
                Self::serialize_header(stat, &mut buf);
            }
            CatalogEntry::Link { stat, target } => {
                Self::serialize_header(stat, &mut buf);
                buf.extend_from_slice(&(target.len() as u32).to_be_bytes());
                buf.extend_from_slice(target);
            }
            CatalogEntry::File { stat, digests } => {
                Self::serialize_header(stat, &mut buf);
                buf.extend_from_slice(&(digests.len() as u32).to_be_bytes());
                for digest in digests {
                    buf.extend_from_slice(digest);
                }
            }
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 29 {
            return Err(Error::IntegrityFailure("catalog entry truncated".into()));
        }
        let version = bytes[0];
        if version != CURRENT_CATALOG_VERSION {
            return Err(Error::IntegrityFailure(format!(
                "unsupported catalog entry version {}",
                version
            )));
        }
        let mode = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let size = u64::from_be_bytes(bytes[5..13].try_into().unwrap());
        let mtime = u64::from_be_bytes(bytes[13..21].try_into().unwrap());
        let uid = u32::from_be_bytes(bytes[21..25].try_into().unwrap());
        let gid = u32::from_be_bytes(bytes[25..29].try_into().unwrap());
        let stat = Stat {
            mode,
            size,
            mtime,
            uid,
            gid,
        };
        let tail = &bytes[29..];

        if stat.is_directory() {
            return Ok(CatalogEntry::Directory(stat));
        }
        if stat.is_link() {
            if tail.len() < 4 {
                return Err(Error::IntegrityFailure("truncated link catalog entry".into()));
            }
            let len = u32::from_be_bytes(tail[0..4].try_into().unwrap()) as usize;
            let target = tail
                .get(4..4 + len)
                .ok_or_else(|| Error::IntegrityFailure("truncated link target".into()))?
                .to_vec();
            return Ok(CatalogEntry::Link { stat, target });
        }

        if tail.len() < 4 {
            return Err(Error::IntegrityFailure("truncated file catalog entry".into()));
        }
        let count = u32::from_be_bytes(tail[0..4].try_into().unwrap()) as usize;
        let digest_bytes = &tail[4..];
        if digest_bytes.len() != count * 32 {
            return Err(Error::IntegrityFailure(
                "file catalog entry digest count mismatch".into(),
            ));
        }
        let digests = digest_bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();
        Ok(CatalogEntry::File { stat, digests })
    }
}

/// Path-addressed record of one backup run's view of the filesystem.
pub struct Catalog {
    db: Db,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let db = sled::Config::default()
            .path(path)
            .use_compression(true)
            .open()?;
        Ok(Self { db })
    }

    pub fn find(&self, full_path: &Path) -> Result<Option<CatalogEntry>, Error> {
        match self.db.get(path_key(full_path))? {
            Some(bytes) => Ok(Some(CatalogEntry::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record a directory or symlink.
    pub fn add(&self, full_path: &Path, stat: Stat, target: Option<Vec<u8>>) -> Result<(), Error> {
        let entry = match target {
            Some(target) => CatalogEntry::Link { stat, target },
            None => CatalogEntry::Directory(stat),
        };
        self.db.insert(path_key(full_path), entry.serialize())?;
        Ok(())
    }

    /// Record a regular file's digest list. `total_length` is the original
    /// plaintext length summed over all chunks, used to catch any
    /// discrepancy between chunking and stat-reported size.
    pub fn add_file(
        &self,
        full_path: &Path,
        mut stat: Stat,
        digests: Vec<[u8; 32]>,
        total_length: u64,
    ) -> Result<(), Error> {
        stat.size = total_length;
        let entry = CatalogEntry::File { stat, digests };
        self.db.insert(path_key(full_path), entry.serialize())?;
        Ok(())
    }

    /// Copy an already-serialized entry from a previous run's catalog
    /// verbatim, used when a file is unchanged and does not need
    /// re-chunking.
    pub fn transfer(&self, full_path: &Path, entry: &CatalogEntry) -> Result<(), Error> {
        self.db.insert(path_key(full_path), entry.serialize())?;
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<(Vec<u8>, CatalogEntry), Error>> + '_ {
        self.db.iter().map(|res| {
            let (key, value) = res?;
            let entry = CatalogEntry::deserialize(&value)?;
            Ok((key.to_vec(), entry))
        })
    }

    /// Paths whose UTF-8-lossy rendering matches any of `patterns`.
    pub fn matching(&self, patterns: &[Regex]) -> Result<Vec<(Vec<u8>, CatalogEntry)>, Error> {
        let mut out = Vec::new();
        for result in self.entries() {
            let (path, entry) = result?;
            let rendered = String::from_utf8_lossy(&path);
            if patterns.iter().any(|re| re.is_match(&rendered)) {
                out.push((path, entry));
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

fn path_key(full_path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    full_path.as_os_str().as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(mode: u32) -> Stat {
        Stat {
            mode,
            size: 1234,
            mtime: 1_700_000_000,
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn directory_entry_round_trip() {
        let entry = CatalogEntry::Directory(stat(MODE_FMT_DIR | 0o755));
        let bytes = entry.serialize();
        assert_eq!(CatalogEntry::deserialize(&bytes).unwrap(), entry);
    }

    #[test]
    fn link_entry_round_trip() {
        let entry = CatalogEntry::Link {
            stat: stat(MODE_FMT_LINK | 0o777),
            target: b"../elsewhere".to_vec(),
        };
        let bytes = entry.serialize();
        assert_eq!(CatalogEntry::deserialize(&bytes).unwrap(), entry);
    }

    #[test]
    fn file_entry_round_trip() {
        let entry = CatalogEntry::File {
            stat: stat(0o100644),
            digests: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
        };
        let bytes = entry.serialize();
        assert_eq!(CatalogEntry::deserialize(&bytes).unwrap(), entry);
    }

    #[test]
    fn has_changed_detects_size_and_mtime_differences() {
        let entry = CatalogEntry::File {
            stat: stat(0o100644),
            digests: vec![],
        };
        let unchanged = stat(0o100644);
        assert!(!entry.has_changed(&unchanged));

        let mut changed = stat(0o100644);
        changed.mtime += 1;
        assert!(entry.has_changed(&changed));
    }

    #[test]
    fn add_find_and_add_file_round_trip_through_sled() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        let path = Path::new("/etc/hosts");

        catalog
            .add_file(path, stat(0o100644), vec![[9u8; 32]], 42)
            .unwrap();
        let found = catalog.find(path).unwrap().unwrap();
        match found {
            CatalogEntry::File { stat, digests } => {
                assert_eq!(stat.size, 42);
                assert_eq!(digests, vec![[9u8; 32]]);
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn matching_filters_by_path_regex() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        catalog
            .add_file(Path::new("/home/alice/notes.txt"), stat(0o100644), vec![], 0)
            .unwrap();
        catalog
            .add_file(Path::new("/home/alice/photo.jpg"), stat(0o100644), vec![], 0)
            .unwrap();

        let patterns = vec![Regex::new(r"\.txt$").unwrap()];
        let matches = catalog.matching(&patterns).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, b"/home/alice/notes.txt");
    }
}
