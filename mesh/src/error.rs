//! Error types for membership and cluster operations.

use std::time::Duration;

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Failures reported by a membership provider.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No seed reachable ({attempted} attempted): {last_error}")]
    NoSeedsReachable { attempted: usize, last_error: String },

    #[error("Leave not acknowledged by {pending} peer(s) within {timeout:?}")]
    LeaveTimeout { pending: usize, timeout: Duration },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Membership provider is shut down")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MembershipError {
    /// Errors that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MembershipError::NoSeedsReachable { .. }
                | MembershipError::LeaveTimeout { .. }
                | MembershipError::Io(_)
        )
    }
}

/// Failures surfaced by the cluster coordinator.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster node name must not be empty")]
    EmptyNodeName,

    #[error(transparent)]
    Membership(#[from] MembershipError),
}
