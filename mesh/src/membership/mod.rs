//! Cluster membership
//!
//! The replication engine does not detect failures or move bytes between
//! nodes itself. It relies on a [`MembershipProvider`] for that and talks to
//! it only through the traits below:
//! - [`EventDelegate`]: join / leave / update notifications from the provider
//! - [`Delegate`]: payload hooks the provider calls every gossip round
//! - [`MembershipProvider`]: join, leave and member listing
//!
//! [`Cluster`] wires the store and broadcast queue into these hooks.

mod cluster;

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use cluster::{Cluster, ClusterConfig, KvDelegate, NodeEvents};

use crate::error::MembershipError;

/// Identity of a cluster member. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// Socket address the node's transport is bound to.
    pub fn socket_addr(&self) -> Result<SocketAddr, MembershipError> {
        self.address
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
            .map_err(|_| MembershipError::InvalidAddress(self.address.clone()))
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        match self.socket_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.endpoint())
    }
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);
}

/// Payload hooks invoked by the provider.
pub trait Delegate: Send + Sync {
    /// Metadata attached to the local node, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user payload arrived from a peer.
    fn notify_msg(&self, msg: &[u8]);

    /// Payloads to piggyback on an outgoing packet. Each costs `overhead`
    /// bytes of framing on top of its length; the total must stay within
    /// `limit`.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for a push/pull exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// State received from a peer during a push/pull exchange.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Everything a provider needs to start.
#[derive(Clone)]
pub struct ProviderConfig {
    pub node: Node,
    pub events: Arc<dyn EventDelegate>,
    pub delegate: Arc<dyn Delegate>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("node", &self.node)
            .field("events", &"<EventDelegate>")
            .field("delegate", &"<Delegate>")
            .finish()
    }
}

/// Creates providers; one implementation per transport.
#[async_trait]
pub trait MembershipFactory: Send + Sync {
    async fn create(
        &self,
        config: ProviderConfig,
    ) -> Result<Arc<dyn MembershipProvider>, MembershipError>;
}

/// Peer discovery, failure detection and message transport.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Contact the given seeds and merge into their cluster. Returns how many
    /// seeds answered; fails only when none did.
    async fn join(&self, seeds: &[String]) -> Result<usize, MembershipError>;

    /// Announce departure and wait up to `timeout` for peers to acknowledge.
    async fn leave(&self, timeout: Duration) -> Result<(), MembershipError>;

    /// Live members, including the local node.
    fn members(&self) -> Vec<Node>;

    fn local_node(&self) -> Node;

    /// Stop background work. Idempotent.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_endpoint() {
        let v4 = Node::new("a", "10.0.0.1", 7947);
        assert_eq!(v4.endpoint(), "10.0.0.1:7947");
        assert_eq!(v4.socket_addr().unwrap().port(), 7947);

        let v6 = Node::new("b", "::1", 7947);
        assert_eq!(v6.endpoint(), "[::1]:7947");
    }

    #[test]
    fn test_node_with_hostname_is_not_a_socket_addr() {
        let node = Node::new("c", "node-c.local", 7947);
        assert!(matches!(
            node.socket_addr(),
            Err(MembershipError::InvalidAddress(_))
        ));
        assert_eq!(node.endpoint(), "node-c.local:7947");
    }
}
