//! Core primitives for Gletscher: content-addressed, encrypted,
//! deduplicating backup to Amazon Glacier.
//!
//! This crate knows how to hash, compress, encrypt, chunk, index, catalog
//! and upload — it has no notion of a filesystem tree, a CLI, or a
//! configuration file on disk. Those live in the `gletscher` binary crate.

pub mod catalog;
pub mod chunk_streamer;
pub mod chunker;
pub mod crypter;
pub mod error;
pub mod glacier;
pub mod index;
pub mod kvpack;
pub mod reconciler;
pub mod treehash;
pub mod uploader;

pub use catalog::{Catalog, CatalogEntry, Stat};
pub use chunk_streamer::ChunkStreamer;
pub use chunker::FileChunker;
pub use crypter::Crypter;
pub use error::Error;
pub use glacier::{GlacierClient, GlacierJob};
pub use index::{Index, IndexEntry};
pub use kvpack::KvFile;
pub use reconciler::InventoriedArchive;
pub use treehash::TreeHasher;
pub use uploader::{PendingUpload, StreamingUploader};
