//! Glacier tree-hash: a binary Merkle tree over 1 MiB blocks of SHA-256.
//!
//! The cold store requires this exact algorithm for every archive upload and
//! every declared sub-range of a multipart upload, including its tie-breaking
//! rule for where to split an odd-length range. See the calibration vectors
//! in the test module below.

use sha2::{Digest, Sha256};

/// Size of one tree-hash block. Fixed by the remote store's contract.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Incremental Glacier-compatible Merkle hash over 1 MiB blocks.
///
/// Bytes are fed in via [`TreeHasher::update`] in any chunking the caller
/// finds convenient; the hasher tracks block boundaries itself. Tree hashes
/// over arbitrary `[start, end)` ranges can be asked for at any time via
/// [`TreeHasher::tree_hash`], including while the final block is still in
/// progress.
#[derive(Clone)]
pub struct TreeHasher {
    digests: Vec<[u8; 32]>,
    current: Sha256,
    length: u64,
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            digests: Vec::new(),
            current: Sha256::new(),
            length: 0,
        }
    }

    /// Total number of bytes fed to the hasher so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Feed more bytes, finalizing completed 1 MiB blocks along the way.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let remaining = BLOCK_SIZE - (self.length % BLOCK_SIZE);
            if data.len() as u64 >= remaining {
                let (head, tail) = data.split_at(remaining as usize);
                self.current.update(head);
                let finished = std::mem::replace(&mut self.current, Sha256::new());
                self.digests.push(finished.finalize().into());
                self.length += remaining;
                data = tail;
            } else {
                self.current.update(data);
                self.length += data.len() as u64;
                data = &[];
            }
        }
    }

    /// Tree hash over `[start, end)`.
    ///
    /// `start` must be 0 or a multiple of [`BLOCK_SIZE`]; `end` must be
    /// `self.len()` or a multiple of `BLOCK_SIZE`, and `start <= end`.
    pub fn tree_hash(&self, start: u64, end: u64) -> [u8; 32] {
        assert!(start <= end && end <= self.length);
        assert!(
            start % BLOCK_SIZE == 0,
            "tree_hash range must start on a block boundary"
        );
        assert!(
            end == self.length || end % BLOCK_SIZE == 0,
            "tree_hash range must end on a block boundary or at the end"
        );

        if start == end {
            // Empty stream (start == end == 0 == length).
            return Sha256::digest([]).into();
        }
        if end - start <= BLOCK_SIZE {
            let block = (start / BLOCK_SIZE) as usize;
            return if block == self.digests.len() {
                self.current.clone().finalize().into()
            } else {
                self.digests[block]
            };
        }

        // Largest power-of-two-blocks split point t such that start + 2t <= end.
        let mut t = BLOCK_SIZE;
        while start + 2 * t <= end {
            t *= 2;
        }
        let mid = start + t;
        let left = self.tree_hash(start, mid);
        let right = self.tree_hash(mid, end);
        let mut combo = Sha256::new();
        combo.update(left);
        combo.update(right);
        combo.finalize().into()
    }

    /// Tree hash over the whole stream fed so far.
    pub fn full_tree_hash(&self) -> [u8; 32] {
        self.tree_hash(0, self.length)
    }
}

/// Convenience wrapper for hashing an in-memory payload in one call, used
/// for archives small enough to upload in a single request.
pub fn tree_hash_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.full_tree_hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of_blocks(blocks: &[&[u8]], trailer: &[u8]) -> String {
        let mut hasher = TreeHasher::new();
        for block in blocks {
            hasher.update(block);
        }
        hasher.update(trailer);
        hex::encode(hasher.full_tree_hash())
    }

    #[test]
    fn empty_stream() {
        let hasher = TreeHasher::new();
        assert_eq!(
            hex::encode(hasher.full_tree_hash()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_block_of_zeroes_char() {
        let block = vec![b'0'; BLOCK_SIZE as usize];
        assert_eq!(
            hash_of_blocks(&[&block], &[]),
            "bf79be0c21a100565100d16b31deee78ce5391f66c0774405d484ce38b6076e0"
        );
    }

    #[test]
    fn two_blocks() {
        let a = vec![b'0'; BLOCK_SIZE as usize];
        let b = vec![b'1'; BLOCK_SIZE as usize];
        assert_eq!(
            hash_of_blocks(&[&a, &b], &[]),
            "d93d23bf20decc64e3a6a1f004df228b0603fda5ea3db86903f47da493e98c85"
        );
    }

    #[test]
    fn three_blocks() {
        let a = vec![b'0'; BLOCK_SIZE as usize];
        let b = vec![b'1'; BLOCK_SIZE as usize];
        let c = vec![b'2'; BLOCK_SIZE as usize];
        assert_eq!(
            hash_of_blocks(&[&a, &b, &c], &[]),
            "be55fa01ae74848aeb58cf4213cb8d6d31596dd511a4a82854f7fb3938b5d6be"
        );
    }

    #[test]
    fn three_blocks_plus_trailer() {
        let a = vec![b'0'; BLOCK_SIZE as usize];
        let b = vec![b'1'; BLOCK_SIZE as usize];
        let c = vec![b'2'; BLOCK_SIZE as usize];
        assert_eq!(
            hash_of_blocks(&[&a, &b, &c], &[b'3']),
            "10d1c8c304aab5431c6c9ebdfb6b10acbd957959504e379f8b433bf80fbe8cc9"
        );
    }

    #[test]
    fn sub_range_matches_incremental_update() {
        let mut hasher = TreeHasher::new();
        let a = vec![1u8; BLOCK_SIZE as usize];
        let b = vec![2u8; BLOCK_SIZE as usize];
        hasher.update(&a);
        hasher.update(&b);
        let first = hasher.tree_hash(0, BLOCK_SIZE);
        let second = hasher.tree_hash(BLOCK_SIZE, 2 * BLOCK_SIZE);
        assert_ne!(first, second);
        let whole = hasher.tree_hash(0, 2 * BLOCK_SIZE);
        assert_eq!(whole, hasher.full_tree_hash());
    }
}
