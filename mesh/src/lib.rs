//! Gossip-replicated key-value store
//!
//! This crate provides the replication core of gossipkv:
//! - A last-write-wins replicated string store
//! - A retransmit-limited broadcast queue piggybacked on gossip
//! - A membership abstraction with UDP and in-process providers
//! - The reconciliation loop that applies inbound mutations

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod membership;
pub mod reconcile;
pub mod store;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use broadcast::{retransmit_limit, BroadcastQueue, DEFAULT_RETRANSMIT_MULT};
pub use codec::{MutationMessage, Operation};
pub use error::{ClusterError, ClusterResult, MembershipError};
pub use membership::{
    Cluster, ClusterConfig, Delegate, EventDelegate, MembershipFactory, MembershipProvider, Node,
    ProviderConfig,
};
pub use reconcile::{apply_mutation, ApplyOutcome, ReconcileStats, Reconciler, ReconcilerConfig};
pub use store::{ReplicatedStore, StoredValue};
pub use transport::{LocalNetwork, UdpConfig, UdpTransport};
