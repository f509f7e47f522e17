//! Multi-account OAuth credential persistence and lifecycle.

pub mod manager;
pub mod store;
