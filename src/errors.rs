//! Transfer and credential error types.
//!
//! Every variant maps to one class in the failure taxonomy: the engine
//! recovers transient / range-already-satisfied / auth-expired conditions
//! locally (up to their retry bounds) and surfaces everything else as a
//! [`TransferError`] carrying the remote diagnostic payload.  The
//! [`TransferError::stage`] accessor names the stage that failed so
//! callers can report `source-read` vs `commit` vs `session-create` vs
//! `credential` alongside the last known progress.

use thiserror::Error;

/// Errors surfaced by the transfer engine and the credential store.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The source could not deliver a requested byte range.
    #[error("source read failed at offset {offset} (length {length}): {message}")]
    SourceRead {
        offset: u64,
        length: u64,
        message: String,
    },

    /// The remote store refused to create an upload session.
    #[error("failed to create upload session ({status}): {body}")]
    SessionCreate { status: u16, body: String },

    /// A commit kept failing with transient statuses past the retry cap.
    #[error("commit at offset {offset} exhausted {attempts} attempts (last status {last_status:?})")]
    TransientExhausted {
        offset: u64,
        attempts: u32,
        last_status: Option<u16>,
    },

    /// The access token was rejected again after a refresh.
    #[error("authorization expired and refresh did not recover it")]
    AuthExpired,

    /// The remote store rejected a call with a non-recoverable status.
    #[error("remote store rejected the request ({status}): {body}")]
    RemoteRejected { status: u16, body: String },

    /// The job was cancelled at a batch boundary.
    #[error("transfer cancelled after {bytes_done}/{bytes_total} bytes")]
    Cancelled { bytes_done: u64, bytes_total: u64 },

    /// An account with this username already exists in the store.
    #[error("account '{username}' already exists")]
    DuplicateUsername { username: String },

    /// No account with this username (or no account at all) exists.
    #[error("account not found{}", username.as_deref().map(|u| format!(": '{u}'")).unwrap_or_default())]
    AccountNotFound { username: Option<String> },

    /// A caller-supplied parameter is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TransferError {
    /// Name the stage this error belongs to, for caller-side display.
    pub fn stage(&self) -> &'static str {
        match self {
            TransferError::SourceRead { .. } => "source-read",
            TransferError::SessionCreate { .. } => "session-create",
            TransferError::TransientExhausted { .. } => "commit",
            TransferError::AuthExpired => "credential",
            TransferError::RemoteRejected { .. } => "commit",
            TransferError::Cancelled { .. } => "cancel",
            TransferError::DuplicateUsername { .. } => "credential",
            TransferError::AccountNotFound { .. } => "credential",
            TransferError::InvalidArgument { .. } => "argument",
            TransferError::Internal(_) => "internal",
        }
    }
}

/// Result alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Generate a 16-character hex identifier (OAuth state, request ids).
pub fn generate_state_token() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}
