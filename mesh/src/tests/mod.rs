//! Internal tests module
//!
//! Multi-node scenarios that need several clusters, stores and loops wired
//! together. They have full access to crate internals.

mod local_cluster;
mod test_utils;
