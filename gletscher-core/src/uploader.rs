//! Streaming multipart uploads with bounded memory and a small, backpressured
//! pool of concurrent part uploads.
//!
//! Callers feed plaintext-sized-or-larger byte slices into [`PendingUpload`]
//! as they become available; once `block_size` worth of data has
//! accumulated, a part is handed off to a background task. At most
//! [`MAX_PENDING_FUTURES`] part uploads are in flight at once — `write`
//! blocks (awaits) rather than buffering unboundedly when the pool is full.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::Error;
use crate::glacier::GlacierClient;
use crate::treehash::{TreeHasher, BLOCK_SIZE as TREE_HASH_BLOCK_SIZE};

pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
pub const MAX_PENDING_FUTURES: usize = 2;

const RETRY_INITIAL_SLEEP: Duration = Duration::from_secs(1);
const RETRY_MAX_SLEEP: Duration = Duration::from_secs(90);

/// Factory for multipart uploads against one Glacier vault.
pub struct StreamingUploader {
    client: Arc<GlacierClient>,
    block_size: u64,
}

impl StreamingUploader {
    pub fn new(client: Arc<GlacierClient>) -> Self {
        Self {
            client,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(client: Arc<GlacierClient>, block_size: u64) -> Self {
        assert!(
            block_size % TREE_HASH_BLOCK_SIZE == 0,
            "block_size must be a multiple of the tree-hash block size"
        );
        Self { client, block_size }
    }

    pub async fn new_upload(&self, description: &str) -> Result<PendingUpload, Error> {
        let upload_id = self
            .client
            .initiate_multipart_upload(self.block_size, description)
            .await?;
        Ok(PendingUpload {
            client: self.client.clone(),
            upload_id,
            block_size: self.block_size,
            tree_hasher: TreeHasher::new(),
            pending_data: Vec::new(),
            pending_data_offset: 0,
            in_flight: JoinSet::new(),
            available_parts: Vec::new(),
        })
    }

    /// Reattach to an in-progress multipart upload after an interrupted run.
    /// Lists the parts the store already holds and returns a [`PendingUpload`]
    /// that will skip re-PUTting any part whose `(start, end, tree_hash)`
    /// still matches one already accepted. The caller must replay the exact
    /// same byte stream from offset 0 for this to line up — fixed-size
    /// chunking guarantees it will, since the same chunks produce the same
    /// part boundaries and sub-range tree hashes.
    pub async fn resume_upload(&self, upload_id: impl Into<String>) -> Result<PendingUpload, Error> {
        let upload_id = upload_id.into();
        let parts = self.client.list_parts(&upload_id).await?;
        let available_parts = parts
            .into_iter()
            .map(|p| {
                let (start, end) = parse_inclusive_range(&p.range_in_bytes)?;
                Ok((start, end, p.sha256_tree_hash))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(PendingUpload {
            client: self.client.clone(),
            upload_id,
            block_size: self.block_size,
            tree_hasher: TreeHasher::new(),
            pending_data: Vec::new(),
            pending_data_offset: 0,
            in_flight: JoinSet::new(),
            available_parts,
        })
    }
}

/// Parse Glacier's `"start-end"` (inclusive) range listing into a
/// half-open `[start, end)` range matching the rest of this module's
/// convention.
fn parse_inclusive_range(range: &str) -> Result<(u64, u64), Error> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| Error::IntegrityFailure(format!("malformed part range: {}", range)))?;
    let start: u64 = start
        .parse()
        .map_err(|_| Error::IntegrityFailure(format!("malformed part range: {}", range)))?;
    let end_inclusive: u64 = end
        .parse()
        .map_err(|_| Error::IntegrityFailure(format!("malformed part range: {}", range)))?;
    Ok((start, end_inclusive + 1))
}

/// One multipart upload in progress. Not `Clone`: there is exactly one
/// writer, matching how the chunk streamer uses it.
pub struct PendingUpload {
    client: Arc<GlacierClient>,
    upload_id: String,
    block_size: u64,
    tree_hasher: TreeHasher,
    pending_data: Vec<u8>,
    pending_data_offset: u64,
    in_flight: JoinSet<Result<(), Error>>,
    available_parts: Vec<(u64, u64, String)>,
}

impl PendingUpload {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Total bytes committed to this upload so far, including data still
    /// buffered locally and not yet part of an uploaded part.
    pub fn bytes_written(&self) -> u64 {
        self.pending_data_offset + self.pending_data.len() as u64
    }

    /// Append data, flushing full-size parts to the upload pool as they
    /// accumulate.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.tree_hasher.update(data);
        self.pending_data.extend_from_slice(data);
        while self.pending_data.len() as u64 >= self.block_size {
            self.flush_one_part().await?;
        }
        Ok(())
    }

    async fn flush_one_part(&mut self) -> Result<(), Error> {
        let take = self.block_size.min(self.pending_data.len() as u64) as usize;
        let part: Vec<u8> = self.pending_data.drain(..take).collect();
        let start = self.pending_data_offset;
        let end = start + part.len() as u64;
        let tree_hash = hex::encode(self.tree_hasher.tree_hash(start, end));

        if self.already_uploaded(start, end, &tree_hash) {
            self.pending_data_offset = end;
            return Ok(());
        }

        self.wait_for_capacity().await?;

        let client = self.client.clone();
        let upload_id = self.upload_id.clone();
        self.in_flight.spawn(async move {
            upload_part_with_retry(&client, &upload_id, (start, end), &tree_hash, part).await
        });

        self.pending_data_offset = end;
        Ok(())
    }

    /// True if the remote store already holds exactly this part, per a
    /// prior `list_parts` call on a resumed upload.
    fn already_uploaded(&self, start: u64, end: u64, tree_hash: &str) -> bool {
        self.available_parts
            .iter()
            .any(|(s, e, h)| *s == start && *e == end && h == tree_hash)
    }

    async fn wait_for_capacity(&mut self) -> Result<(), Error> {
        while self.in_flight.len() >= MAX_PENDING_FUTURES {
            if let Some(result) = self.in_flight.join_next().await {
                result??;
            }
        }
        Ok(())
    }

    /// Flush any remaining buffered data, wait for every in-flight part,
    /// and complete the multipart upload. Returns `(archive_id, tree_hash)`.
    pub async fn finish(mut self) -> Result<(String, String), Error> {
        if !self.pending_data.is_empty() {
            self.flush_one_part().await?;
        }
        while let Some(result) = self.in_flight.join_next().await {
            result??;
        }

        let archive_size = self.tree_hasher.len();
        let tree_hash = hex::encode(self.tree_hasher.full_tree_hash());
        let archive_id = self
            .client
            .complete_multipart_upload(&self.upload_id, archive_size, &tree_hash)
            .await?;
        Ok((archive_id, tree_hash))
    }

    pub fn abort(self) -> (Arc<GlacierClient>, String) {
        (self.client, self.upload_id)
    }
}

async fn upload_part_with_retry(
    client: &GlacierClient,
    upload_id: &str,
    range: (u64, u64),
    tree_hash: &str,
    data: Vec<u8>,
) -> Result<(), Error> {
    let mut sleep = RETRY_INITIAL_SLEEP;
    loop {
        match client.upload_part(upload_id, range, tree_hash, data.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if is_retryable(&err) => {
                log::warn!(
                    "part upload {}..{} failed ({}), retrying in {:?}",
                    range.0,
                    range.1,
                    err,
                    sleep
                );
                tokio::time::sleep(sleep).await;
                sleep = (sleep * 2).min(RETRY_MAX_SLEEP);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Http(_) => true,
        Error::RemoteRejection { status, .. } => is_retryable_status(*status),
        _ => false,
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429
}
