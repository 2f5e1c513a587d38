//! Fixed-size file chunking.
//!
//! Gletscher does not use content-defined chunking: files are split into
//! fixed-size pieces (default 32 MiB, configurable) purely to bound memory
//! and per-chunk upload size. Deduplication comes from hashing the resulting
//! pieces, not from choosing chunk boundaries cleverly.

use std::io::Read;

use crate::error::Error;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Lazily slices a reader into `max_chunk_size`-sized pieces, optionally
/// stopping early at an overall byte cap.
///
/// Iteration stops after the first short read, or once `max_size` bytes
/// (when set) have been read, whichever comes first. A zero-length file
/// yields no chunks at all (matching a plain `read() == 0` check) rather
/// than a degenerate empty one — a file with zero chunks is exactly how the
/// catalog represents a zero-byte file.
pub struct FileChunker<R> {
    reader: R,
    max_chunk_size: usize,
    remaining: u64,
    done: bool,
}

impl<R: Read> FileChunker<R> {
    pub fn new(reader: R, max_chunk_size: usize) -> Self {
        Self::with_size_cap(reader, max_chunk_size, u64::MAX)
    }

    /// Like [`FileChunker::new`], but never reads past `max_size` bytes in
    /// total, even if the underlying reader has more to give.
    pub fn with_size_cap(reader: R, max_chunk_size: usize, max_size: u64) -> Self {
        assert!(max_chunk_size > 0, "max_chunk_size must be positive");
        Self {
            reader,
            max_chunk_size,
            remaining: max_size,
            done: false,
        }
    }

    /// Read the next chunk, or `None` once the file is exhausted or the
    /// size cap has been reached.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.done || self.remaining == 0 {
            return Ok(None);
        }

        let to_read = (self.max_chunk_size as u64).min(self.remaining) as usize;
        let mut buf = vec![0u8; to_read];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < buf.len() {
            self.done = true;
        }
        buf.truncate(filled);
        self.remaining -= filled as u64;

        if filled == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

impl<R: Read> Iterator for FileChunker<R> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_file_yields_no_chunks() {
        let chunker = FileChunker::new(Cursor::new(Vec::<u8>::new()), 16);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        assert_eq!(chunks, Vec::<Vec<u8>>::new());
    }

    #[test]
    fn exact_multiple_of_chunk_size() {
        let data = vec![1u8; 32];
        let chunker = FileChunker::new(Cursor::new(data.clone()), 16);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        assert_eq!(chunks, vec![vec![1u8; 16], vec![1u8; 16]]);
    }

    #[test]
    fn trailing_partial_chunk() {
        let mut data = vec![1u8; 32];
        data.extend_from_slice(&[2u8; 5]);
        let chunker = FileChunker::new(Cursor::new(data), 16);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![2u8; 5]);
    }

    #[test]
    fn single_byte_smaller_than_chunk_size() {
        let chunker = FileChunker::new(Cursor::new(vec![9u8]), 16);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        assert_eq!(chunks, vec![vec![9u8]]);
    }

    #[test]
    fn size_cap_stops_reading_early_even_if_more_data_remains() {
        let data = vec![1u8; 64];
        let chunker = FileChunker::with_size_cap(Cursor::new(data), 16, 22);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 22);
        assert_eq!(chunks, vec![vec![1u8; 16], vec![1u8; 6]]);
    }

    #[test]
    fn size_cap_larger_than_file_has_no_effect() {
        let data = vec![1u8; 10];
        let chunker = FileChunker::with_size_cap(Cursor::new(data.clone()), 16, 1_000);
        let chunks: Vec<_> = chunker.map(Result::unwrap).collect();
        assert_eq!(chunks, vec![data]);
    }
}
