//! Chunked transfer engine.
//!
//! Drives one job end to end: create the upload session, then for each
//! chunk fetch its segments concurrently, commit the chunk sequentially,
//! and report progress.  At most one chunk is buffered at a time, so
//! fetch never runs ahead of commit, and memory stays bounded by one
//! chunk regardless of content size.
//!
//! Cancellation is observed only at chunk boundaries: a cancelled job
//! never leaves a partially committed chunk behind.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Result, TransferError};
use crate::fetch::{fetch_chunk, segment_plan};
use crate::remote::session::UploadSession;
use crate::remote::store::RemoteStore;
use crate::source::Source;

/// Async progress callback, awaited after every committed chunk with
/// `(bytes_done, bytes_total)`.  Awaiting it is the engine's only
/// backpressure: a slow consumer slows the transfer rather than losing
/// updates.
pub type ProgressFn = Box<
    dyn Fn(u64, u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// One transfer job's fixed parameters.
pub struct TransferJob {
    /// Destination path, absolute from the remote root.
    pub remote_path: String,
    /// Declared content length in bytes.
    pub total_length: u64,
    /// Bytes committed per range PUT.
    pub chunk_size: u64,
    /// Maximum concurrent segment fetches per chunk.
    pub concurrency: u64,
}

/// Transfer engine bound to one remote store.
pub struct TransferEngine {
    remote: Arc<dyn RemoteStore>,
}

impl TransferEngine {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    /// Run one transfer job to completion.  Returns the name the remote
    /// assigned to the finished item.
    pub async fn start(
        &self,
        source: Arc<dyn Source>,
        job: &TransferJob,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<String> {
        if job.total_length == 0 {
            return Err(TransferError::InvalidArgument {
                message: "cannot transfer zero-length content".to_string(),
            });
        }
        if job.chunk_size == 0 || job.concurrency == 0 {
            return Err(TransferError::InvalidArgument {
                message: "chunk_size and concurrency must be nonzero".to_string(),
            });
        }

        let mut session =
            UploadSession::create(self.remote.as_ref(), &job.remote_path, job.total_length)
                .await?;

        info!(
            "transfer started: {} ({} bytes, {}-byte chunks, concurrency {})",
            job.remote_path, job.total_length, job.chunk_size, job.concurrency
        );
        on_progress(0, job.total_length).await;

        let mut item_name = None;

        while !session.is_complete() {
            // Chunk boundary: the only cancellation point, so committed
            // bytes are always a whole number of chunks.
            if cancel.is_cancelled() {
                let bytes_done = session.next_offset();
                info!(
                    "transfer cancelled: {} ({}/{} bytes committed)",
                    job.remote_path, bytes_done, job.total_length
                );
                return Err(TransferError::Cancelled {
                    bytes_done,
                    bytes_total: job.total_length,
                });
            }

            let offset = session.next_offset();
            let chunk_len = job.chunk_size.min(job.total_length - offset);
            let plan = segment_plan(offset, chunk_len, job.concurrency);

            debug!(
                "fetching chunk [{}, {}) in {} segments",
                offset,
                offset + chunk_len,
                plan.len()
            );
            let chunk = fetch_chunk(Arc::clone(&source), &plan).await?;

            if let Some(name) = session.commit(self.remote.as_ref(), chunk).await? {
                item_name = Some(name);
            }

            on_progress(session.next_offset(), job.total_length).await;
        }

        // The remote usually names the item on the terminal commit; fall
        // back to the path's file name when it does not (e.g. a 416 on
        // the final range).
        let name = item_name.unwrap_or_else(|| {
            job.remote_path
                .rsplit('/')
                .next()
                .unwrap_or(&job.remote_path)
                .to_string()
        });

        info!("transfer complete: {} -> {}", job.remote_path, name);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{ScriptedRemote, Step};
    use crate::source::MemorySource;
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn job(total_length: u64, chunk_size: u64, concurrency: u64) -> TransferJob {
        TransferJob {
            remote_path: "/driveferry/f.bin".to_string(),
            total_length,
            chunk_size,
            concurrency,
        }
    }

    /// Progress recorder usable as a `ProgressFn`.
    fn progress_recorder() -> (Arc<Mutex<Vec<(u64, u64)>>>, ProgressFn) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&calls);
        let callback: ProgressFn = Box::new(move |done, total| {
            let recorder = Arc::clone(&recorder);
            Box::pin(async move {
                recorder.lock().unwrap().push((done, total));
            })
        });
        (calls, callback)
    }

    #[tokio::test]
    async fn test_whole_file_in_fixed_chunks() {
        // 10 MiB in 2 MiB chunks: exactly five commits of 2 MiB each.
        let total = 10 * MIB;
        let remote = Arc::new(ScriptedRemote::new(total));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(total as usize)));
        let (calls, callback) = progress_recorder();

        let name = engine
            .start(source, &job(total, 2 * MIB, 5), callback, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(name, "f.bin");
        assert_eq!(
            remote.committed(),
            vec![
                (0, 2 * MIB),
                (2 * MIB, 2 * MIB),
                (4 * MIB, 2 * MIB),
                (6 * MIB, 2 * MIB),
                (8 * MIB, 2 * MIB),
            ]
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.first(), Some(&(0, total)));
        assert_eq!(calls.last(), Some(&(total, total)));
        // One initial call plus one per committed chunk.
        assert_eq!(calls.len(), 6);
    }

    #[tokio::test]
    async fn test_short_final_chunk() {
        let total = 5 * MIB + 7;
        let remote = Arc::new(ScriptedRemote::new(total));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(total as usize)));
        let (_, callback) = progress_recorder();

        engine
            .start(source, &job(total, 2 * MIB, 5), callback, CancellationToken::new())
            .await
            .unwrap();

        let commits = remote.committed();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[2], (4 * MIB, MIB + 7));
        // Commits cover the declared length exactly.
        let sum: u64 = commits.iter().map(|&(_, len)| len).sum();
        assert_eq!(sum, total);
    }

    #[tokio::test]
    async fn test_fetch_failure_commits_nothing_for_batch() {
        // Source holds fewer bytes than the declared length: the second
        // chunk's fetch fails and nothing of it reaches the remote.
        let remote = Arc::new(ScriptedRemote::new(200));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(150)));
        let (_, callback) = progress_recorder();

        let err = engine
            .start(source, &job(200, 100, 4), callback, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::SourceRead { .. }));
        // Only the first chunk was committed.
        assert_eq!(remote.committed(), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn test_cancellation_at_chunk_boundary() {
        let remote = Arc::new(ScriptedRemote::new(400));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(400)));
        let cancel = CancellationToken::new();

        // Cancel after the second committed chunk, from inside the
        // progress callback.
        let token = cancel.clone();
        let callback: ProgressFn = Box::new(move |done, _total| {
            let token = token.clone();
            Box::pin(async move {
                if done >= 200 {
                    token.cancel();
                }
            })
        });

        let err = engine
            .start(source, &job(400, 100, 4), callback, cancel)
            .await
            .unwrap_err();

        match err {
            TransferError::Cancelled {
                bytes_done,
                bytes_total,
            } => {
                assert_eq!(bytes_done, 200);
                assert_eq!(bytes_total, 400);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Whole chunks only: exactly two commits happened.
        assert_eq!(remote.committed(), vec![(0, 100), (100, 100)]);
    }

    #[tokio::test]
    async fn test_session_create_failure_before_any_commit() {
        let remote = Arc::new(ScriptedRemote::new(100).fail_create(507, "quota exceeded"));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(100)));
        let (calls, callback) = progress_recorder();

        let err = engine
            .start(source, &job(100, 50, 2), callback, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::SessionCreate { status: 507, .. }));
        assert!(remote.committed().is_empty());
        // No progress reported for a job that never started.
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_rejected() {
        let remote = Arc::new(ScriptedRemote::new(0));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(Vec::new()));
        let (_, callback) = progress_recorder();

        let err = engine
            .start(source, &job(0, 100, 4), callback, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_retried_chunk_still_completes() {
        // A transient failure mid-transfer is retried by the session and
        // the job still finishes with every byte accounted for.
        let remote = Arc::new(
            ScriptedRemote::new(300).script([Step::Accept, Step::Transient(Some(502))]),
        );
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(300)));
        let (calls, callback) = progress_recorder();

        let name = engine
            .start(source, &job(300, 100, 4), callback, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(name, "f.bin");
        // Second chunk was sent twice (transient then accepted).
        assert_eq!(
            remote.committed(),
            vec![(0, 100), (100, 100), (100, 100), (200, 100)]
        );
        // Progress reflects committed chunks, not wire attempts.
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[(0, 300), (100, 300), (200, 300), (300, 300)]
        );
    }

    #[tokio::test]
    async fn test_terminal_416_falls_back_to_path_name() {
        // The final range was already satisfied, so the remote never
        // reports an item name; the engine derives one from the path.
        let remote = Arc::new(ScriptedRemote::new(200).script([Step::Accept, Step::AlreadySatisfied]));
        let engine = TransferEngine::new(Arc::clone(&remote) as Arc<dyn RemoteStore>);
        let source = Arc::new(MemorySource::new(pattern(200)));
        let (_, callback) = progress_recorder();

        let name = engine
            .start(source, &job(200, 100, 4), callback, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(name, "f.bin");
    }
}
