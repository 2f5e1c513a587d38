//! Turns a stream of `(digest, plaintext chunk)` pairs into sealed,
//! multipart-uploaded data archives, recording where each chunk landed in
//! the index as archives are sealed.
//!
//! Storage-version-2 archive layout: a random 0-127 byte pad (so that
//! identical early backups don't produce byte-identical archives, which
//! would otherwise leak information about the archive's boundary to anyone
//! who can see ciphertext lengths), followed by the encrypted form of each
//! chunk back to back: `IV(16) ‖ prefix(1) ‖ maybe-bzip2(plaintext)`. Each
//! chunk's `IndexEntry` records the start offset and persisted length of
//! its encrypted record within the archive, keyed by the archive's own
//! Glacier tree hash — which is only known once the archive is sealed, so
//! entries are buffered until then.

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use crate::crypter::Crypter;
use crate::error::Error;
use crate::index::{Index, IndexEntry};
use crate::uploader::{PendingUpload, StreamingUploader};

pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING_DIGESTS: usize = 256 * 1024;

struct PendingEntry {
    storage_version: u8,
    offset: u64,
    persisted_length: u32,
    original_length: u32,
}

/// Chunk -> sealed archive pipeline for one backup run.
pub struct ChunkStreamer<'a> {
    index: &'a Index,
    uploader: &'a StreamingUploader,
    crypter: &'a Crypter,
    backup_id: Uuid,
    max_archive_size: u64,
    max_pending_digests: usize,
    current_upload: Option<PendingUpload>,
    pending: HashMap<[u8; 32], PendingEntry>,
}

impl<'a> ChunkStreamer<'a> {
    pub fn new(
        index: &'a Index,
        uploader: &'a StreamingUploader,
        crypter: &'a Crypter,
        backup_id: Uuid,
    ) -> Self {
        Self {
            index,
            uploader,
            crypter,
            backup_id,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            max_pending_digests: DEFAULT_MAX_PENDING_DIGESTS,
            current_upload: None,
            pending: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, max_archive_size: u64, max_pending_digests: usize) -> Self {
        self.max_archive_size = max_archive_size;
        self.max_pending_digests = max_pending_digests;
        self
    }

    /// Upload one chunk, deduplicating against both the persistent index
    /// and chunks already pending in the archive currently being built.
    /// Returns `true` if the chunk was newly written, `false` if it was
    /// already known.
    pub async fn upload(&mut self, digest: [u8; 32], plaintext: &[u8]) -> Result<bool, Error> {
        if self.index.contains(&digest)? || self.pending.contains_key(&digest) {
            return Ok(false);
        }

        let encrypted = self.crypter.encrypt_chunk(&digest, plaintext);

        let needs_rotation = match &self.current_upload {
            None => true,
            Some(upload) => {
                upload.bytes_written() + encrypted.len() as u64 > self.max_archive_size
                    || self.pending.len() >= self.max_pending_digests
            }
        };
        if needs_rotation {
            if self.current_upload.is_some() {
                self.finish_upload().await?;
            }
            self.start_new_upload().await?;
        }

        // Captured *after* any rotation above, so a chunk written to a
        // freshly-started archive is recorded against that archive's own
        // offsets rather than the sealed one's.
        let upload = self.current_upload.as_mut().expect("just ensured open");
        let start_offset = upload.bytes_written();
        upload.write(&encrypted).await?;

        self.pending.insert(
            digest,
            PendingEntry {
                storage_version: crate::crypter::CURRENT_STORAGE_VERSION,
                offset: start_offset,
                persisted_length: encrypted.len() as u32,
                original_length: plaintext.len() as u32,
            },
        );
        Ok(true)
    }

    /// Seal any archive still open. Must be called once at the end of a
    /// backup run; safe to call on a streamer with nothing pending.
    pub async fn finish(&mut self) -> Result<(), Error> {
        if self.current_upload.is_some() {
            self.finish_upload().await?;
        }
        Ok(())
    }

    async fn start_new_upload(&mut self) -> Result<(), Error> {
        let description = json!({
            "backup": self.backup_id.to_string(),
            "type": "data",
        })
        .to_string();
        let mut upload = self.uploader.new_upload(&description).await?;

        let pad_len = (rand::random::<u8>() % 128) as usize;
        if pad_len > 0 {
            upload.write(&vec![0u8; pad_len]).await?;
        }
        self.current_upload = Some(upload);
        Ok(())
    }

    async fn finish_upload(&mut self) -> Result<(), Error> {
        let upload = self.current_upload.take().expect("caller checked Some");
        let (_, tree_hash_hex) = upload.finish().await?;
        let tree_hash_bytes = hex::decode(&tree_hash_hex)
            .map_err(|_| Error::IntegrityFailure("tree hash was not valid hex".into()))?;
        let mut file_tree_hash = [0u8; 32];
        if tree_hash_bytes.len() != 32 {
            return Err(Error::IntegrityFailure("tree hash was not 32 bytes".into()));
        }
        file_tree_hash.copy_from_slice(&tree_hash_bytes);

        for (digest, entry) in self.pending.drain() {
            let index_entry = IndexEntry {
                file_tree_hash,
                storage_version: entry.storage_version,
                offset: entry.offset,
                persisted_length: entry.persisted_length,
                original_length: entry.original_length,
            };
            self.index.add(&digest, &index_entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;

    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;
    use crate::crypter::Crypter;
    use crate::glacier::GlacierClient;
    use crate::uploader::StreamingUploader;

    /// A Glacier stand-in that accepts any multipart upload and always
    /// reports an empty `list_parts`. Good enough to exercise rotation and
    /// dedup logic without a real vault; it does not check SigV4 signatures.
    async fn start_mock_glacier() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(handle_mock_request))
                        .await;
                });
            }
        });
        port
    }

    async fn handle_mock_request(
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let tree_hash = req
            .headers()
            .get("x-amz-sha256-tree-hash")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let _ = req.into_body().collect().await;

        let mut builder = Response::builder();
        let body: Vec<u8>;
        if method == Method::POST && path.ends_with("/multipart-uploads") {
            builder = builder
                .status(201)
                .header("x-amz-multipart-upload-id", format!("mock-upload-{}", path.len()));
            body = Vec::new();
        } else if method == Method::PUT && path.contains("/multipart-uploads/") {
            builder = builder.status(204);
            body = Vec::new();
        } else if method == Method::POST && path.contains("/multipart-uploads/") {
            builder = builder
                .status(201)
                .header("x-amz-sha256-tree-hash", tree_hash)
                .header("x-amz-archive-id", "mock-archive-id");
            body = Vec::new();
        } else if method == Method::GET && path.contains("/multipart-uploads/") {
            builder = builder.status(200).header("content-type", "application/json");
            body = br#"{"Parts":[],"Marker":null}"#.to_vec();
        } else {
            builder = builder.status(404);
            body = Vec::new();
        }

        Ok(builder.body(Full::new(Bytes::from(body))).unwrap())
    }

    async fn mock_client() -> Arc<GlacierClient> {
        let port = start_mock_glacier().await;
        let client = GlacierClient::new("us-east-1", "acct", "vault", "AKID", "secret")
            .unwrap()
            .with_endpoint_override(format!("http://127.0.0.1:{}", port));
        Arc::new(client)
    }

    fn digest_of(byte: u8) -> [u8; 32] {
        let crypter = Crypter::new([1u8; crate::crypter::KEY_SIZE]);
        crypter.hash(&[byte; 16])
    }

    #[tokio::test]
    async fn dedups_across_two_uploads_of_the_same_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        let client = mock_client().await;
        let uploader = StreamingUploader::with_block_size(client, 1024 * 1024);
        let crypter = Crypter::new([1u8; crate::crypter::KEY_SIZE]);
        let mut streamer =
            ChunkStreamer::new(&index, &uploader, &crypter, Uuid::nil());

        let plaintext = vec![5u8; 16];
        let digest = crypter.hash(&plaintext);

        assert!(streamer.upload(digest, &plaintext).await.unwrap());
        assert!(!streamer.upload(digest, &plaintext).await.unwrap());

        streamer.finish().await.unwrap();
        assert!(index.contains(&digest).unwrap());
    }

    #[tokio::test]
    async fn rotates_to_a_new_archive_once_pending_digest_count_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        let client = mock_client().await;
        let uploader = StreamingUploader::with_block_size(client, 1024 * 1024);
        let crypter = Crypter::new([2u8; crate::crypter::KEY_SIZE]);
        let mut streamer = ChunkStreamer::new(&index, &uploader, &crypter, Uuid::nil())
            .with_limits(DEFAULT_MAX_ARCHIVE_SIZE, 2);

        let d0 = digest_of(0);
        let d1 = digest_of(1);
        let d2 = digest_of(2);
        streamer.upload(d0, &[0u8; 16]).await.unwrap();
        streamer.upload(d1, &[1u8; 16]).await.unwrap();
        // Third chunk exceeds max_pending_digests=2, forcing a rotation
        // before it is written.
        streamer.upload(d2, &[2u8; 16]).await.unwrap();
        streamer.finish().await.unwrap();

        let first_archive = index.get(&d0).unwrap().unwrap().file_tree_hash;
        let second_archive = index.get(&d2).unwrap().unwrap().file_tree_hash;
        assert_eq!(index.get(&d1).unwrap().unwrap().file_tree_hash, first_archive);
        assert_ne!(first_archive, second_archive);
    }

    #[tokio::test]
    async fn rotates_to_a_new_archive_once_max_archive_size_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        let client = mock_client().await;
        let uploader = StreamingUploader::with_block_size(client, 1024 * 1024);
        let crypter = Crypter::new([3u8; crate::crypter::KEY_SIZE]);
        // Small enough that a second 64-byte chunk cannot fit alongside the
        // first's encrypted form (IV + prefix + payload > 64 bytes already).
        let mut streamer = ChunkStreamer::new(&index, &uploader, &crypter, Uuid::nil())
            .with_limits(96, DEFAULT_MAX_PENDING_DIGESTS);

        let d0 = digest_of(10);
        let d1 = digest_of(11);
        streamer.upload(d0, &[7u8; 64]).await.unwrap();
        streamer.upload(d1, &[8u8; 64]).await.unwrap();
        streamer.finish().await.unwrap();

        let first_archive = index.get(&d0).unwrap().unwrap().file_tree_hash;
        let second_archive = index.get(&d1).unwrap().unwrap().file_tree_hash;
        assert_ne!(first_archive, second_archive);
    }

    #[tokio::test]
    async fn every_committed_digest_resolves_inside_its_own_archives_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        let client = mock_client().await;
        let uploader = StreamingUploader::with_block_size(client, 1024 * 1024);
        let crypter = Crypter::new([4u8; crate::crypter::KEY_SIZE]);
        let mut streamer = ChunkStreamer::new(&index, &uploader, &crypter, Uuid::nil());

        let digests: Vec<[u8; 32]> = (0..5u8).map(digest_of).collect();
        for (i, digest) in digests.iter().enumerate() {
            streamer.upload(*digest, &vec![i as u8; 32]).await.unwrap();
        }
        streamer.finish().await.unwrap();

        for digest in &digests {
            let entry = index.get(digest).unwrap().unwrap();
            let end = entry.offset + entry.persisted_length as u64;
            // A pad of up to 127 bytes precedes the first record; every
            // record's range must still fall at or after it and never
            // overlap a neighbor incorrectly, i.e. simply be well-formed.
            assert!(end > entry.offset);
        }
    }

    #[tokio::test]
    async fn finish_on_an_empty_streamer_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        let client = mock_client().await;
        let uploader = StreamingUploader::with_block_size(client, 1024 * 1024);
        let crypter = Crypter::new([5u8; crate::crypter::KEY_SIZE]);
        let mut streamer = ChunkStreamer::new(&index, &uploader, &crypter, Uuid::nil());
        streamer.finish().await.unwrap();
        assert!(index.is_empty());
    }
}
