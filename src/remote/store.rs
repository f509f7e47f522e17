//! Abstract remote store contract.
//!
//! The upload session and engine only see this trait, so tests can
//! substitute a scripted implementation and the wire client stays
//! swappable.  Range-PUT results are explicit tagged values rather than
//! loosely-shaped response objects: the caller pattern-matches instead
//! of probing status codes.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Result of a newly created upload session.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// Opaque endpoint the session's range PUTs are issued against.
    pub upload_url: String,
}

/// Outcome of a session-create call.  Any failure here is fatal to the
/// job, but the remote diagnostic payload is preserved for the caller.
#[derive(Debug, Clone)]
pub enum CreateSessionOutcome {
    Created(CreatedSession),
    Failed { status: u16, body: String },
}

/// Outcome of a single range PUT against an upload session.
#[derive(Debug, Clone)]
pub enum PutRangeOutcome {
    /// The remote accepted the range.
    Accepted {
        /// Next offset the remote expects, when it reported one.
        next_offset: Option<u64>,
        /// Item name, present on the terminal commit only.
        item_name: Option<String>,
    },
    /// 416: the range was already received by an earlier (retried but
    /// actually successful) attempt.  Treated as success upstream.
    RangeAlreadySatisfied,
    /// 401: the bearer token was rejected.
    AuthExpired,
    /// Transient failure class: transport timeout or 408/500/502/503/504.
    /// `status` is `None` for transport-level failures.
    Transient { status: Option<u16> },
    /// Any other status: fatal, with the remote diagnostic payload.
    Rejected { status: u16, body: String },
}

/// Async remote store contract.
pub trait RemoteStore: Send + Sync + 'static {
    /// Request an upload session for `remote_path` covering `total_length`
    /// bytes.  Called once per transfer job.
    fn create_upload_session(
        &self,
        remote_path: &str,
        total_length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CreateSessionOutcome>> + Send + '_>>;

    /// Issue one range PUT covering `[offset, offset + data.len())` of a
    /// `total_length`-byte upload.  Never retries internally: each call
    /// maps to exactly one wire request, classified into an outcome.
    fn put_range(
        &self,
        upload_url: &str,
        offset: u64,
        total_length: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutRangeOutcome>> + Send + '_>>;

    /// Refresh the active account's tokens and persist them durably
    /// before returning.
    fn refresh_credentials(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
