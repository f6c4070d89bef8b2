//! In-process membership
//!
//! Every [`LocalMembership`] created from the same [`LocalNetwork`] shares one
//! hub. Join and leave fire events synchronously; payloads only move when the
//! owner calls [`LocalNetwork::gossip_round`], which keeps multi-node tests
//! deterministic. Partitioned members lose all traffic in both directions.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::DEFAULT_PACKET_SIZE;
use crate::{
    error::MembershipError,
    membership::{
        Delegate, EventDelegate, MembershipFactory, MembershipProvider, Node, ProviderConfig,
    },
};

/// Framing cost charged per payload in a simulated packet.
const LOCAL_MESSAGE_OVERHEAD: usize = 8;

#[derive(Clone)]
struct Attached {
    node: Node,
    events: Arc<dyn EventDelegate>,
    delegate: Arc<dyn Delegate>,
}

#[derive(Default)]
struct Hub {
    attached: BTreeMap<String, Attached>,
    /// Attached members that have formed a cluster together.
    joined: BTreeSet<String>,
    partitioned: BTreeSet<String>,
}

impl Hub {
    fn reachable(&self, name: &str) -> bool {
        self.attached.contains_key(name) && !self.partitioned.contains(name)
    }

    fn resolve_seed(&self, seed: &str) -> Option<String> {
        self.attached
            .values()
            .find(|a| a.node.name == seed || a.node.endpoint() == seed)
            .map(|a| a.node.name.clone())
    }

    /// Events to fire when `name` enters the cluster.
    fn admit(&mut self, name: &str) -> Vec<(Arc<dyn EventDelegate>, Node)> {
        let mut events = Vec::new();
        if !self.joined.insert(name.to_string()) {
            return events;
        }
        let Some(newcomer) = self.attached.get(name).cloned() else {
            return events;
        };
        for other in self.joined.iter().filter(|n| n.as_str() != name) {
            if let Some(existing) = self.attached.get(other) {
                events.push((existing.events.clone(), newcomer.node.clone()));
                events.push((newcomer.events.clone(), existing.node.clone()));
            }
        }
        events
    }

    /// Events to fire when `name` leaves the cluster.
    fn evict(&mut self, name: &str) -> Vec<(Arc<dyn EventDelegate>, Node)> {
        let mut events = Vec::new();
        if !self.joined.remove(name) {
            return events;
        }
        let Some(departed) = self.attached.get(name) else {
            return events;
        };
        for other in &self.joined {
            if let Some(remaining) = self.attached.get(other) {
                events.push((remaining.events.clone(), departed.node.clone()));
            }
        }
        // A lone survivor is no longer part of a cluster.
        if self.joined.len() == 1 {
            self.joined.clear();
        }
        events
    }
}

fn fire_joins(events: Vec<(Arc<dyn EventDelegate>, Node)>) {
    for (delegate, node) in events {
        delegate.notify_join(&node);
    }
}

fn fire_leaves(events: Vec<(Arc<dyn EventDelegate>, Node)>) {
    for (delegate, node) in events {
        delegate.notify_leave(&node);
    }
}

/// Shared in-process network; clone it to hand to several nodes.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.hub.lock();
        f.debug_struct("LocalNetwork")
            .field("attached", &hub.attached.keys().collect::<Vec<_>>())
            .field("joined", &hub.joined)
            .field("partitioned", &hub.partitioned)
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one gossip round: every reachable member drains its broadcast
    /// queue once per peer and the payloads are delivered to that peer.
    /// Traffic to or from a partitioned member is drained and lost.
    /// Returns the number of payloads delivered.
    pub fn gossip_round(&self) -> usize {
        let (members, partitioned) = {
            let hub = self.hub.lock();
            let members: Vec<Attached> = hub
                .joined
                .iter()
                .filter_map(|name| hub.attached.get(name).cloned())
                .collect();
            (members, hub.partitioned.clone())
        };

        let mut delivered = 0;
        for sender in &members {
            for receiver in members.iter().filter(|m| m.node.name != sender.node.name) {
                let payloads = sender
                    .delegate
                    .get_broadcasts(LOCAL_MESSAGE_OVERHEAD, DEFAULT_PACKET_SIZE);
                if partitioned.contains(&sender.node.name)
                    || partitioned.contains(&receiver.node.name)
                {
                    continue;
                }
                for payload in &payloads {
                    receiver.delegate.notify_msg(payload);
                }
                delivered += payloads.len();
            }
        }
        debug!(delivered, members = members.len(), "Local gossip round");
        delivered
    }

    /// Drop all traffic to and from `name`.
    pub fn partition(&self, name: &str) {
        self.hub.lock().partitioned.insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.hub.lock().partitioned.remove(name);
    }

    /// One full state exchange between `a` and `b`. Returns false when either
    /// side is unknown or unreachable.
    pub fn push_pull(&self, a: &str, b: &str) -> bool {
        let (left, right) = {
            let hub = self.hub.lock();
            if !hub.reachable(a) || !hub.reachable(b) {
                return false;
            }
            match (hub.attached.get(a), hub.attached.get(b)) {
                (Some(left), Some(right)) => (left.clone(), right.clone()),
                _ => return false,
            }
        };

        let from_left = left.delegate.local_state(false);
        let from_right = right.delegate.local_state(false);
        right.delegate.merge_remote_state(&from_left, false);
        left.delegate.merge_remote_state(&from_right, false);
        true
    }

    /// Names of members currently in the cluster.
    pub fn joined(&self) -> Vec<String> {
        self.hub.lock().joined.iter().cloned().collect()
    }
}

#[async_trait]
impl MembershipFactory for LocalNetwork {
    async fn create(
        &self,
        config: ProviderConfig,
    ) -> Result<Arc<dyn MembershipProvider>, MembershipError> {
        let ProviderConfig {
            node,
            events,
            delegate,
        } = config;

        {
            let mut hub = self.hub.lock();
            if hub.attached.contains_key(&node.name) {
                return Err(MembershipError::Bind {
                    addr: node.endpoint(),
                    source: io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("node {} already attached", node.name),
                    ),
                });
            }
            hub.attached.insert(
                node.name.clone(),
                Attached {
                    node: node.clone(),
                    events: events.clone(),
                    delegate,
                },
            );
        }

        events.notify_join(&node);
        Ok(Arc::new(LocalMembership {
            network: self.clone(),
            node,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Provider handle for one node on a [`LocalNetwork`].
pub struct LocalMembership {
    network: LocalNetwork,
    node: Node,
    closed: AtomicBool,
}

#[async_trait]
impl MembershipProvider for LocalMembership {
    async fn join(&self, seeds: &[String]) -> Result<usize, MembershipError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MembershipError::Closed);
        }
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut events = Vec::new();
        let mut contacted = 0;
        let mut last_error = String::from("no seeds given");
        {
            let mut hub = self.network.hub.lock();
            if hub.partitioned.contains(&self.node.name) {
                return Err(MembershipError::NoSeedsReachable {
                    attempted: seeds.len(),
                    last_error: "local node is partitioned".into(),
                });
            }
            for seed in seeds {
                let Some(name) = hub.resolve_seed(seed) else {
                    last_error = format!("unknown seed {seed}");
                    continue;
                };
                if !hub.reachable(&name) {
                    last_error = format!("seed {seed} unreachable");
                    continue;
                }
                contacted += 1;
                if name != self.node.name {
                    events.extend(hub.admit(&name));
                    events.extend(hub.admit(&self.node.name));
                }
            }
        }

        fire_joins(events);
        if contacted == 0 {
            return Err(MembershipError::NoSeedsReachable {
                attempted: seeds.len(),
                last_error,
            });
        }
        Ok(contacted)
    }

    async fn leave(&self, timeout: Duration) -> Result<(), MembershipError> {
        let (events, pending) = {
            let mut hub = self.network.hub.lock();
            if !hub.joined.contains(&self.node.name) {
                return Ok(());
            }
            if hub.partitioned.contains(&self.node.name) {
                let pending = hub.joined.len().saturating_sub(1);
                (Vec::new(), pending)
            } else {
                (hub.evict(&self.node.name), 0)
            }
        };

        if pending > 0 {
            tokio::time::sleep(timeout).await;
            warn!(node = %self.node.name, pending, "Leave was not acknowledged");
            return Err(MembershipError::LeaveTimeout { pending, timeout });
        }
        fire_leaves(events);
        info!(node = %self.node.name, "Left local cluster");
        Ok(())
    }

    fn members(&self) -> Vec<Node> {
        let hub = self.network.hub.lock();
        if !hub.joined.contains(&self.node.name) {
            return vec![self.node.clone()];
        }
        hub.joined
            .iter()
            .filter_map(|name| hub.attached.get(name).map(|a| a.node.clone()))
            .collect()
    }

    fn local_node(&self) -> Node {
        self.node.clone()
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Peers that never saw a leave notice detect the node as gone.
        let events = {
            let mut hub = self.network.hub.lock();
            let events = hub.evict(&self.node.name);
            hub.attached.remove(&self.node.name);
            hub.partitioned.remove(&self.node.name);
            events
        };
        fire_leaves(events);
    }
}
