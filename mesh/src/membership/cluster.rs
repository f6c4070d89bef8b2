use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use super::{Delegate, EventDelegate, MembershipFactory, MembershipProvider, Node, ProviderConfig};
use crate::{
    broadcast::{BroadcastQueue, DEFAULT_RETRANSMIT_MULT},
    codec::MutationMessage,
    error::{ClusterError, ClusterResult},
    store::{ReplicatedStore, StoredValue},
};

/// Tunables for the cluster coordinator.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub retransmit_mult: usize,
    /// Exchange full store snapshots during push/pull. Merges never carry
    /// deletions, so a key deleted here can come back from a peer that still
    /// holds it once the local tombstone has been pruned.
    pub anti_entropy: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
            anti_entropy: false,
        }
    }
}

// ============================================================================
// Delegates
// ============================================================================

/// Tracks the live-node count from membership events.
pub struct NodeEvents {
    live_nodes: Arc<AtomicUsize>,
    span: Span,
}

impl NodeEvents {
    pub fn new(live_nodes: Arc<AtomicUsize>, span: Span) -> Self {
        Self { live_nodes, span }
    }
}

impl EventDelegate for NodeEvents {
    fn notify_join(&self, node: &Node) {
        let live = self.live_nodes.fetch_add(1, Ordering::AcqRel) + 1;
        self.span
            .in_scope(|| info!(member = %node.name, address = %node.endpoint(), live, "Node joined"));
    }

    fn notify_leave(&self, node: &Node) {
        let previous = self
            .live_nodes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        let live = previous.saturating_sub(1);
        self.span
            .in_scope(|| info!(member = %node.name, live, "Node left"));
    }

    fn notify_update(&self, node: &Node) {
        self.span
            .in_scope(|| trace!(member = %node.name, "Ignoring node update"));
    }
}

/// Bridges provider payload hooks to the inbound channel, the broadcast queue
/// and (for push/pull) the store.
pub struct KvDelegate {
    inbound: mpsc::Sender<Vec<u8>>,
    broadcasts: Arc<BroadcastQueue>,
    store: ReplicatedStore,
    anti_entropy: bool,
    span: Span,
}

impl KvDelegate {
    pub fn new(
        inbound: mpsc::Sender<Vec<u8>>,
        broadcasts: Arc<BroadcastQueue>,
        store: ReplicatedStore,
        anti_entropy: bool,
        span: Span,
    ) -> Self {
        Self {
            inbound,
            broadcasts,
            store,
            anti_entropy,
            span,
        }
    }
}

impl Delegate for KvDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        if msg.is_empty() {
            return;
        }
        // Never block the transport on a slow consumer.
        match self.inbound.try_send(msg.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.span.in_scope(|| {
                warn!(len = msg.len(), "Inbound channel full, dropping message")
            }),
            Err(TrySendError::Closed(_)) => self
                .span
                .in_scope(|| debug!("Inbound channel closed, dropping message")),
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        if !self.anti_entropy {
            return Vec::new();
        }
        let snapshot = self.store.export();
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                self.span
                    .in_scope(|| debug!(keys = snapshot.len(), join, "Exporting local state"));
                bytes
            }
            Err(e) => {
                self.span
                    .in_scope(|| warn!(error = %e, "Failed to encode local state"));
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if !self.anti_entropy || buf.is_empty() {
            return;
        }
        match serde_json::from_slice::<BTreeMap<String, StoredValue>>(buf) {
            Ok(remote) => {
                let adopted = self.store.merge_remote(remote);
                self.span
                    .in_scope(|| info!(adopted, join, "Merged remote state"));
            }
            Err(e) => self
                .span
                .in_scope(|| warn!(error = %e, "Discarding malformed remote state")),
        }
    }
}

// ============================================================================
// Cluster Coordinator
// ============================================================================

/// Local node's view of the cluster.
///
/// Owns the membership provider and the broadcast queue, and keeps the
/// live-node count the queue uses to size retransmissions.
pub struct Cluster {
    local_node: Node,
    provider: Arc<dyn MembershipProvider>,
    broadcasts: Arc<BroadcastQueue>,
    live_nodes: Arc<AtomicUsize>,
    span: Span,
}

impl Cluster {
    /// Build the delegates and start a provider through `factory`.
    ///
    /// Payloads delivered by the provider are forwarded into `inbound`.
    pub async fn create(
        local_node: Node,
        factory: &dyn MembershipFactory,
        config: ClusterConfig,
        store: ReplicatedStore,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> ClusterResult<Self> {
        if local_node.name.is_empty() {
            return Err(ClusterError::EmptyNodeName);
        }

        let span = info_span!("cluster", node = %local_node.name);
        let live_nodes = Arc::new(AtomicUsize::new(0));
        let broadcasts = Arc::new(BroadcastQueue::new(
            live_nodes.clone(),
            config.retransmit_mult,
        ));

        let events = Arc::new(NodeEvents::new(live_nodes.clone(), span.clone()));
        let delegate = Arc::new(KvDelegate::new(
            inbound,
            broadcasts.clone(),
            store,
            config.anti_entropy,
            span.clone(),
        ));

        span.in_scope(|| {
            info!(
                address = %local_node.endpoint(),
                retransmit_mult = config.retransmit_mult,
                anti_entropy = config.anti_entropy,
                "Creating cluster"
            )
        });

        let provider = factory
            .create(ProviderConfig {
                node: local_node.clone(),
                events,
                delegate,
            })
            .instrument(span.clone())
            .await?;

        Ok(Self {
            local_node: provider.local_node(),
            provider,
            broadcasts,
            live_nodes,
            span,
        })
    }

    /// Merge into an existing cluster through `seeds`. Fails when no seed was
    /// reachable; retrying is up to the caller.
    pub async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        self.span
            .in_scope(|| info!(seeds = ?seeds, "Joining cluster"));
        let contacted = self
            .provider
            .join(seeds)
            .instrument(self.span.clone())
            .await?;
        self.span
            .in_scope(|| info!(contacted, "Joined cluster"));
        Ok(contacted)
    }

    /// Announce departure and wait up to `timeout`. The provider is shut down
    /// whether or not every peer acknowledged.
    pub async fn leave(&self, timeout: Duration) -> ClusterResult<()> {
        self.span.in_scope(|| info!("Leaving cluster"));
        let result = self
            .provider
            .leave(timeout)
            .instrument(self.span.clone())
            .await;
        self.provider.shutdown().await;
        self.broadcasts.reset();
        result.map_err(ClusterError::from)
    }

    pub fn members(&self) -> Vec<Node> {
        self.provider.members()
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn live_nodes(&self) -> usize {
        self.live_nodes.load(Ordering::Acquire)
    }

    /// Queue a local mutation for dissemination.
    pub fn queue_broadcast(&self, msg: &MutationMessage) -> bool {
        self.broadcasts.queue_broadcast(msg)
    }

    pub fn broadcasts(&self) -> &Arc<BroadcastQueue> {
        &self.broadcasts
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("local_node", &self.local_node)
            .field("live_nodes", &self.live_nodes())
            .field("pending_broadcasts", &self.broadcasts.len())
            .finish()
    }
}
