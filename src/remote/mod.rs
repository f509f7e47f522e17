//! Remote store: trait, wire client, upload session, OAuth plumbing.

pub mod auth;
pub mod graph;
pub mod session;
pub mod store;
