//! The digest index: a persistent map from chunk digest to the archive and
//! byte range that holds its encrypted, compressed bytes.
//!
//! Backed by [`sled`], the same embedded store the catalog uses. One index
//! is shared by every backup taken under a given secret key; it never
//! shrinks, since chunks are never deleted while any catalog still
//! references them.

use sled::Db;

use crate::error::Error;

pub const CURRENT_INDEX_VERSION: u8 = 1;

/// Where one chunk's encrypted bytes live: which sealed archive (identified
/// by its full tree hash), at what offset, and how long the stored and
/// original (plaintext) forms are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_tree_hash: [u8; 32],
    pub storage_version: u8,
    pub offset: u64,
    pub persisted_length: u32,
    pub original_length: u32,
}

const SERIALIZED_LEN: usize = 1 + 1 + 32 + 8 + 4 + 4;

impl IndexEntry {
    pub fn serialize(&self) -> [u8; SERIALIZED_LEN] {
        let mut buf = [0u8; SERIALIZED_LEN];
        buf[0] = CURRENT_INDEX_VERSION;
        buf[1] = self.storage_version;
        buf[2..34].copy_from_slice(&self.file_tree_hash);
        buf[34..42].copy_from_slice(&self.offset.to_be_bytes());
        buf[42..46].copy_from_slice(&self.persisted_length.to_be_bytes());
        buf[46..50].copy_from_slice(&self.original_length.to_be_bytes());
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != SERIALIZED_LEN {
            return Err(Error::IntegrityFailure(format!(
                "index entry has unexpected length {}",
                bytes.len()
            )));
        }
        let version = bytes[0];
        if version != CURRENT_INDEX_VERSION {
            return Err(Error::IntegrityFailure(format!(
                "unsupported index entry version {}",
                version
            )));
        }
        let storage_version = bytes[1];
        let mut file_tree_hash = [0u8; 32];
        file_tree_hash.copy_from_slice(&bytes[2..34]);
        let offset = u64::from_be_bytes(bytes[34..42].try_into().unwrap());
        let persisted_length = u32::from_be_bytes(bytes[42..46].try_into().unwrap());
        let original_length = u32::from_be_bytes(bytes[46..50].try_into().unwrap());
        Ok(Self {
            file_tree_hash,
            storage_version,
            offset,
            persisted_length,
            original_length,
        })
    }
}

/// Digest-addressed chunk index.
pub struct Index {
    db: Db,
}

impl Index {
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let db = sled::Config::default()
            .path(path)
            .use_compression(true)
            .open()?;
        Ok(Self { db })
    }

    pub fn get(&self, digest: &[u8; 32]) -> Result<Option<IndexEntry>, Error> {
        match self.db.get(digest)? {
            Some(bytes) => Ok(Some(IndexEntry::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, digest: &[u8; 32]) -> Result<bool, Error> {
        Ok(self.db.contains_key(digest)?)
    }

    /// Insert a brand-new digest. Fails with [`Error::DuplicateDigest`] if
    /// the digest is already recorded — the index is append-only.
    pub fn add(&self, digest: &[u8; 32], entry: &IndexEntry) -> Result<(), Error> {
        let inserted = self
            .db
            .compare_and_swap(digest, None as Option<&[u8]>, Some(entry.serialize().to_vec()))?;
        match inserted {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::DuplicateDigest),
        }
    }

    /// Merge an entry discovered by re-scanning a file already uploaded in
    /// a prior, partially-failed run. Unlike [`Index::add`], re-adding the
    /// same digest with an identical `original_length` is a harmless no-op;
    /// a mismatched `original_length` for the same digest indicates a
    /// genuine hash collision or corruption and is rejected.
    pub fn merge_temporary(&self, digest: &[u8; 32], entry: &IndexEntry) -> Result<(), Error> {
        match self.get(digest)? {
            None => self.add(digest, entry),
            Some(existing) if existing.original_length == entry.original_length => Ok(()),
            Some(_) => Err(Error::IndexConflict),
        }
    }

    /// Iterate over every `(digest, entry)` pair currently recorded.
    pub fn entries(&self) -> impl Iterator<Item = Result<([u8; 32], IndexEntry), Error>> + '_ {
        self.db.iter().map(|res| {
            let (key, value) = res?;
            let mut digest = [0u8; 32];
            if key.len() != 32 {
                return Err(Error::IntegrityFailure(
                    "index key is not a 32-byte digest".into(),
                ));
            }
            digest.copy_from_slice(&key);
            let entry = IndexEntry::deserialize(&value)?;
            Ok((digest, entry))
        })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(tag: u8) -> IndexEntry {
        IndexEntry {
            file_tree_hash: [tag; 32],
            storage_version: 2,
            offset: 4096,
            persisted_length: 128,
            original_length: 256,
        }
    }

    #[test]
    fn serialize_round_trip() {
        let entry = sample_entry(7);
        let bytes = entry.serialize();
        assert_eq!(bytes.len(), SERIALIZED_LEN);
        let restored = IndexEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, restored);
    }

    #[test]
    fn add_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();
        let digest = [1u8; 32];
        let entry = sample_entry(9);
        assert!(!index.contains(&digest).unwrap());
        index.add(&digest, &entry).unwrap();
        assert!(index.contains(&digest).unwrap());
        assert_eq!(index.get(&digest).unwrap(), Some(entry));
    }

    #[test]
    fn add_rejects_duplicate_digest() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();
        let digest = [2u8; 32];
        index.add(&digest, &sample_entry(1)).unwrap();
        let err = index.add(&digest, &sample_entry(2)).unwrap_err();
        assert!(matches!(err, Error::DuplicateDigest));
    }

    #[test]
    fn merge_temporary_is_idempotent_for_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();
        let digest = [3u8; 32];
        let entry = sample_entry(5);
        index.merge_temporary(&digest, &entry).unwrap();
        index.merge_temporary(&digest, &entry).unwrap();
        assert_eq!(index.get(&digest).unwrap(), Some(entry));
    }

    #[test]
    fn merge_temporary_rejects_conflicting_original_length() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();
        let digest = [4u8; 32];
        let mut entry = sample_entry(5);
        index.merge_temporary(&digest, &entry).unwrap();
        entry.original_length += 1;
        let err = index.merge_temporary(&digest, &entry).unwrap_err();
        assert!(matches!(err, Error::IndexConflict));
    }

    #[test]
    fn entries_iterates_everything_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("index")).unwrap();
        for i in 0..5u8 {
            index.add(&[i; 32], &sample_entry(i)).unwrap();
        }
        let mut seen: Vec<_> = index.entries().map(|r| r.unwrap()).collect();
        seen.sort_by_key(|(digest, _)| *digest);
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[2].0, [2u8; 32]);
    }
}
