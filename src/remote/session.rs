//! Resumable upload session.
//!
//! Owns the commit offset and the retry/idempotence policy for range
//! PUTs.  Commits are strictly sequential: the session hands out the
//! next offset itself, so callers cannot reorder or parallelize them.
//!
//! Policy, in precedence order:
//!   1. transient class (transport timeout, 408/500/502/503/504):
//!      retry the same commit up to 5 attempts total with a fixed
//!      100 ms delay, then fail with `TransientExhausted`;
//!   2. 416 range-already-satisfied: treat as success and advance —
//!      this absorbs duplicate delivery from a retried-but-actually-
//!      successful earlier attempt;
//!   3. 401: refresh the active account's tokens exactly once, retry
//!      the same commit once; a second 401 is fatal;
//!   4. anything else: fatal, remote diagnostic payload attached.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::store::{CreateSessionOutcome, PutRangeOutcome, RemoteStore};
use crate::errors::{Result, TransferError};

/// Maximum attempts for one commit within the transient class.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Fixed delay between transient retries.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Remote-side upload context for one transfer job.
///
/// `next_offset` is monotonically non-decreasing, only advances on
/// accepted (or already-satisfied) commits, and never exceeds
/// `total_length`.  The session is consumed by its job and never reused.
#[derive(Debug)]
pub struct UploadSession {
    upload_url: String,
    total_length: u64,
    next_offset: u64,
}

impl UploadSession {
    /// Request an upload session from the remote store.  Called once per
    /// job; any failure is fatal and surfaces the remote payload.
    pub async fn create(
        remote: &dyn RemoteStore,
        remote_path: &str,
        total_length: u64,
    ) -> Result<Self> {
        let outcome = remote
            .create_upload_session(remote_path, total_length)
            .await
            .map_err(|e| TransferError::SessionCreate {
                status: 0,
                body: e.to_string(),
            })?;

        match outcome {
            CreateSessionOutcome::Created(created) => {
                debug!(
                    "upload session created for {} ({} bytes)",
                    remote_path, total_length
                );
                Ok(Self {
                    upload_url: created.upload_url,
                    total_length,
                    next_offset: 0,
                })
            }
            CreateSessionOutcome::Failed { status, body } => {
                Err(TransferError::SessionCreate { status, body })
            }
        }
    }

    /// Commit one chunk at the session's next offset.
    ///
    /// Returns the remote item name when the remote reports one (the
    /// terminal commit).  On success the offset advances by the chunk
    /// length; on fatal errors the session must be discarded.
    pub async fn commit(
        &mut self,
        remote: &dyn RemoteStore,
        chunk: Bytes,
    ) -> Result<Option<String>> {
        let length = chunk.len() as u64;
        let offset = self.next_offset;

        if length == 0 {
            return Err(TransferError::InvalidArgument {
                message: "cannot commit an empty chunk".to_string(),
            });
        }
        if offset + length > self.total_length {
            return Err(TransferError::InvalidArgument {
                message: format!(
                    "commit [{}, {}) overruns declared length {}",
                    offset,
                    offset + length,
                    self.total_length
                ),
            });
        }

        let mut attempts: u32 = 0;
        let mut refreshed = false;

        loop {
            attempts += 1;

            let outcome = remote
                .put_range(&self.upload_url, offset, self.total_length, chunk.clone())
                .await?;

            match outcome {
                PutRangeOutcome::Accepted {
                    next_offset,
                    item_name,
                } => {
                    if let Some(reported) = next_offset {
                        if reported != offset + length {
                            debug!(
                                "remote reports next offset {} (expected {})",
                                reported,
                                offset + length
                            );
                        }
                    }
                    self.next_offset = offset + length;
                    return Ok(item_name);
                }

                PutRangeOutcome::RangeAlreadySatisfied => {
                    // An earlier attempt actually landed; do not resend.
                    debug!("range [{}, {}) already satisfied", offset, offset + length);
                    self.next_offset = offset + length;
                    return Ok(None);
                }

                PutRangeOutcome::Transient { status } => {
                    if attempts >= MAX_COMMIT_ATTEMPTS {
                        warn!(
                            "commit at offset {} exhausted {} attempts (last status {:?})",
                            offset, attempts, status
                        );
                        return Err(TransferError::TransientExhausted {
                            offset,
                            attempts,
                            last_status: status,
                        });
                    }
                    debug!(
                        "transient failure on commit at offset {} (status {:?}), attempt {}/{}",
                        offset, status, attempts, MAX_COMMIT_ATTEMPTS
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }

                PutRangeOutcome::AuthExpired => {
                    if refreshed {
                        return Err(TransferError::AuthExpired);
                    }
                    refreshed = true;
                    debug!("commit at offset {} hit 401, refreshing token", offset);
                    remote
                        .refresh_credentials()
                        .await
                        .map_err(|_| TransferError::AuthExpired)?;
                }

                PutRangeOutcome::Rejected { status, body } => {
                    return Err(TransferError::RemoteRejected { status, body });
                }
            }
        }
    }

    /// Offset the next commit will cover.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Declared total length of the upload.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Whether every byte has been committed.
    pub fn is_complete(&self) -> bool {
        self.next_offset == self.total_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{ScriptedRemote, Step};

    fn chunk(len: usize) -> Bytes {
        Bytes::from(vec![0xAB; len])
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let remote = ScriptedRemote::new(100).fail_create(507, "quota exceeded");
        let err = UploadSession::create(&remote, "/f.bin", 100)
            .await
            .unwrap_err();
        match err {
            TransferError::SessionCreate { status, body } => {
                assert_eq!(status, 507);
                assert!(body.contains("quota"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_commits_advance_offset() {
        let remote = ScriptedRemote::new(100);
        let mut session = UploadSession::create(&remote, "/f.bin", 100).await.unwrap();

        assert_eq!(session.next_offset(), 0);
        session.commit(&remote, chunk(40)).await.unwrap();
        assert_eq!(session.next_offset(), 40);
        session.commit(&remote, chunk(40)).await.unwrap();
        assert_eq!(session.next_offset(), 80);
        let name = session.commit(&remote, chunk(20)).await.unwrap();
        assert!(session.is_complete());
        assert_eq!(name.as_deref(), Some("f.bin"));

        assert_eq!(remote.committed(), vec![(0, 40), (40, 40), (80, 20)]);
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds() {
        // Scenario B: 503 twice then accepted — exactly 2 retries.
        let remote = ScriptedRemote::new(10)
            .script([Step::Transient(Some(503)), Step::Transient(Some(503))]);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        session.commit(&remote, chunk(10)).await.unwrap();
        assert_eq!(session.next_offset(), 10);
        // 2 failed attempts + 1 success = 3 wire calls.
        assert_eq!(remote.committed().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_exhaustion() {
        let remote = ScriptedRemote::new(10).script([
            Step::Transient(Some(503)),
            Step::Transient(Some(500)),
            Step::Transient(None),
            Step::Transient(Some(502)),
            Step::Transient(Some(504)),
        ]);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        let err = session.commit(&remote, chunk(10)).await.unwrap_err();
        match err {
            TransferError::TransientExhausted {
                offset,
                attempts,
                last_status,
            } => {
                assert_eq!(offset, 0);
                assert_eq!(attempts, 5);
                assert_eq!(last_status, Some(504));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // No sixth attempt.
        assert_eq!(remote.committed().len(), 5);
        // Offset never advanced.
        assert_eq!(session.next_offset(), 0);
    }

    #[tokio::test]
    async fn test_range_already_satisfied_is_success() {
        // Scenario C: a 416 advances without resending and without error.
        let remote = ScriptedRemote::new(20).script([Step::AlreadySatisfied]);
        let mut session = UploadSession::create(&remote, "/f.bin", 20).await.unwrap();

        let name = session.commit(&remote, chunk(10)).await.unwrap();
        assert!(name.is_none());
        assert_eq!(session.next_offset(), 10);
        // Exactly one wire call for that range.
        assert_eq!(remote.committed(), vec![(0, 10)]);

        // The next commit targets the following range.
        session.commit(&remote, chunk(10)).await.unwrap();
        assert_eq!(remote.committed(), vec![(0, 10), (10, 10)]);
    }

    #[tokio::test]
    async fn test_auth_expired_refreshes_once_and_retries() {
        let remote = ScriptedRemote::new(10).script([Step::Auth]);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        session.commit(&remote, chunk(10)).await.unwrap();
        assert_eq!(remote.refresh_count(), 1);
        assert_eq!(remote.committed().len(), 2);
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_fatal() {
        let remote = ScriptedRemote::new(10).script([Step::Auth, Step::Auth]);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        let err = session.commit(&remote, chunk(10)).await.unwrap_err();
        assert!(matches!(err, TransferError::AuthExpired));
        assert_eq!(remote.refresh_count(), 1);
        assert_eq!(err.stage(), "credential");
    }

    #[tokio::test]
    async fn test_rejection_carries_payload() {
        let remote = ScriptedRemote::new(10)
            .script([Step::Reject(409, "nameAlreadyExists".to_string())]);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        let err = session.commit(&remote, chunk(10)).await.unwrap_err();
        match err {
            TransferError::RemoteRejected { status, body } => {
                assert_eq!(status, 409);
                assert!(body.contains("nameAlreadyExists"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_cannot_overrun_total_length() {
        let remote = ScriptedRemote::new(10);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        let err = session.commit(&remote, chunk(11)).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument { .. }));
        // Nothing was sent.
        assert!(remote.committed().is_empty());
    }

    #[tokio::test]
    async fn test_empty_chunk_rejected() {
        let remote = ScriptedRemote::new(10);
        let mut session = UploadSession::create(&remote, "/f.bin", 10).await.unwrap();

        let err = session.commit(&remote, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument { .. }));
    }
}
