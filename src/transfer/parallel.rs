//! Parallel chunked downloads.
//!
//! The target file is sized up front, then fixed-size chunks are fetched
//! with several requests in flight and written at their offsets by a single
//! writer. Chunks arrive out of order; only the writer touches the file.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::budget::BudgetError;
use super::progress::ProgressTracker;

/// Size of one download request.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Paid media cannot be downloaded: the owner requires payment to access it")]
    PaidMedia,

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSize {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Transfer request failed: {0}")]
    Request(String),

    #[error("Connection budget: {0}")]
    Budget(#[from] BudgetError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote file that can be fetched in chunks or as a whole.
pub trait MediaSource: Send + Sync {
    /// Size in bytes, 0 when unknown.
    fn size(&self) -> u64;

    /// Fetches chunk `index` of `chunk_size` bytes.
    fn fetch_chunk(
        &self,
        index: u64,
        chunk_size: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransferError>> + Send;

    /// Downloads the whole file through the client's standard path.
    fn download_to(&self, path: &Path) -> impl Future<Output = Result<u64, TransferError>> + Send;
}

/// Number of chunks a file of `size` bytes splits into.
#[must_use]
pub const fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Expected length of chunk `index`.
#[must_use]
pub fn expected_chunk_len(size: u64, chunk_size: usize, index: u64) -> u64 {
    let offset = index * chunk_size as u64;
    size.saturating_sub(offset).min(chunk_size as u64)
}

/// Downloads `source` into `path` using up to `connections` requests at once.
///
/// Returns the number of bytes written.
pub async fn download_parallel<S: MediaSource>(
    source: &S,
    path: &Path,
    connections: usize,
    progress: &mut ProgressTracker,
) -> Result<u64, TransferError> {
    let size = source.size();
    let chunks = chunk_count(size, CHUNK_SIZE);

    debug!(
        "Parallel download of {} bytes: {} chunks over {} connections",
        size, chunks, connections
    );

    let mut file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;

    let mut fetched = std::pin::pin!(
        stream::iter(0..chunks)
            .map(|index| async move { (index, source.fetch_chunk(index, CHUNK_SIZE).await) })
            .buffer_unordered(connections.max(1))
    );

    let mut written = 0_u64;
    while let Some((index, result)) = fetched.next().await {
        let bytes = result?;
        let expected = expected_chunk_len(size, CHUNK_SIZE, index);
        if bytes.len() as u64 != expected {
            return Err(TransferError::ChunkSize {
                index,
                expected,
                actual: bytes.len() as u64,
            });
        }

        file.seek(SeekFrom::Start(index * CHUNK_SIZE as u64)).await?;
        file.write_all(&bytes).await?;
        written += expected;
        progress.update(written);
    }

    file.flush().await?;
    file.sync_all().await?;

    Ok(written)
}
