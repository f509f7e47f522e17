//! Driveferry library — chunked cloud-drive transfer engine.
//!
//! This crate provides the core components for moving large content into
//! a cloud drive over resumable upload sessions: a transfer engine with
//! concurrent segment fetch and strictly sequential chunk commit, a
//! Microsoft Graph remote store client, and a multi-account OAuth
//! credential store backed by SQLite.

pub mod config;
pub mod credentials;
pub mod engine;
pub mod errors;
pub mod fetch;
pub mod remote;
pub mod source;

pub use credentials::manager::CredentialManager;
pub use credentials::store::SqliteCredentialStore;
pub use engine::{TransferEngine, TransferJob};
pub use errors::{Result, TransferError};
pub use remote::graph::GraphClient;
pub use remote::store::RemoteStore;
pub use source::{HttpSource, MemorySource, Source};
