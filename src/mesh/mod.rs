//! Replication core
//!
//! This module re-exports the gossipkv-mesh crate so the binary and the API
//! share one set of paths.

pub use gossipkv_mesh::*;
