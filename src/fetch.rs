//! Concurrent segment fetch.
//!
//! One chunk is split into at most `concurrency` contiguous segments,
//! pulled from the source in parallel, then reassembled in offset order.
//! The whole batch is all-or-nothing: a single failed or short segment
//! read aborts the chunk, and nothing from it reaches the remote.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{Result, TransferError};
use crate::source::Source;

/// Split `[chunk_offset, chunk_offset + chunk_len)` into at most
/// `concurrency` contiguous segments of equal size (the last one may be
/// shorter).  Returns `(offset, length)` pairs in offset order.
pub fn segment_plan(chunk_offset: u64, chunk_len: u64, concurrency: u64) -> Vec<(u64, u64)> {
    if chunk_len == 0 || concurrency == 0 {
        return Vec::new();
    }

    // Ceiling division so concurrency segments always cover the chunk.
    let segment_len = chunk_len.div_ceil(concurrency);
    let mut segments = Vec::new();
    let mut offset = chunk_offset;
    let end = chunk_offset + chunk_len;

    while offset < end {
        let length = segment_len.min(end - offset);
        segments.push((offset, length));
        offset += length;
    }

    segments
}

/// Fetch every segment of one chunk concurrently and reassemble the
/// chunk's bytes in offset order.
pub async fn fetch_chunk(source: Arc<dyn Source>, segments: &[(u64, u64)]) -> Result<Bytes> {
    let handles: Vec<JoinHandle<(u64, u64, anyhow::Result<Bytes>)>> = segments
        .iter()
        .map(|&(offset, length)| {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let result = source.read_range(offset, length).await;
                (offset, length, result)
            })
        })
        .collect();

    let total: u64 = segments.iter().map(|&(_, len)| len).sum();
    let mut chunk = BytesMut::with_capacity(total as usize);

    // Handles are joined in plan order, so reassembly is ordered even
    // when the reads complete out of order.
    for handle in handles {
        let (offset, length, result) = handle
            .await
            .map_err(|e| TransferError::Internal(anyhow::anyhow!("segment task panicked: {e}")))?;

        let data = result.map_err(|e| TransferError::SourceRead {
            offset,
            length,
            message: e.to_string(),
        })?;

        if data.len() as u64 != length {
            return Err(TransferError::SourceRead {
                offset,
                length,
                message: format!("short read: got {} bytes", data.len()),
            });
        }

        chunk.extend_from_slice(&data);
    }

    debug!("fetched chunk of {} bytes in {} segments", total, segments.len());
    Ok(chunk.freeze())
}
