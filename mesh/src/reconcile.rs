//! Reconciliation loop
//!
//! The single consumer of the inbound channel. It applies decoded mutations to
//! the store, periodically reports cluster membership and leaves the cluster
//! when told to shut down.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    codec::{MutationMessage, Operation},
    membership::Cluster,
    store::{ReplicatedStore, StoredValue},
};

/// How often members are reported when not configured otherwise.
pub const DEFAULT_MEMBER_REPORT_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for peers to acknowledge departure.
pub const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a delete keeps rejecting older writes.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub member_report_interval: Duration,
    pub leave_timeout: Duration,
    /// Tombstones older than this are pruned on each member report tick.
    pub tombstone_ttl: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            member_report_interval: DEFAULT_MEMBER_REPORT_INTERVAL,
            leave_timeout: DEFAULT_LEAVE_TIMEOUT,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

/// Result of applying one mutation to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store changed.
    Applied,
    /// A timestamped mutation lost against a newer local write.
    Stale,
    /// A delete for a key that is not present. A timestamped one still
    /// leaves a tombstone.
    NoOp,
    /// Operation not understood by this version.
    Ignored,
}

/// Apply a decoded mutation.
///
/// Mutations carrying their origination time go through last-write-wins.
/// Deletes count as writes: the tombstone they leave rejects any set that is
/// not newer, whichever arrives first. Mutations without a timestamp are
/// stamped on arrival: sets overwrite and deletes remove unconditionally.
///
/// Ordering holds while the tombstone is kept. A set delayed beyond the
/// tombstone lifetime can bring a deleted key back.
pub fn apply_mutation(store: &ReplicatedStore, msg: &MutationMessage) -> ApplyOutcome {
    match (&msg.operation, msg.timestamp) {
        (Operation::Set, Some(at)) => {
            let remote = StoredValue::new(msg.value.clone(), at);
            if store.merge_entry(msg.key.clone(), remote) {
                ApplyOutcome::Applied
            } else {
                ApplyOutcome::Stale
            }
        }
        (Operation::Set, None) => {
            store.set(msg.key.clone(), msg.value.clone());
            ApplyOutcome::Applied
        }
        (Operation::Delete, Some(at)) => {
            if store.delete_if_not_newer(&msg.key, at) {
                ApplyOutcome::Applied
            } else if store.contains_key(&msg.key) {
                ApplyOutcome::Stale
            } else {
                ApplyOutcome::NoOp
            }
        }
        (Operation::Delete, None) => {
            if store.delete(&msg.key) {
                ApplyOutcome::Applied
            } else {
                ApplyOutcome::NoOp
            }
        }
        (Operation::Unknown(_), _) => ApplyOutcome::Ignored,
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub member_reports: u64,
    pub tombstones_pruned: u64,
}

pub struct Reconciler {
    cluster: Arc<Cluster>,
    store: ReplicatedStore,
    inbound: mpsc::Receiver<Vec<u8>>,
    config: ReconcilerConfig,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<Cluster>,
        store: ReplicatedStore,
        inbound: mpsc::Receiver<Vec<u8>>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            inbound,
            config,
            stats: ReconcileStats::default(),
        }
    }

    /// Run until `shutdown` fires or the inbound channel closes, then leave the
    /// cluster. A failed leave is logged; the loop still returns normally.
    #[instrument(skip_all, fields(node = %self.cluster.local_node().name))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ReconcileStats {
        let period = self.config.member_report_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            report_interval = ?period,
            "Reconciliation loop started"
        );

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            warn!("Stop signal received");
                            break;
                        }
                    }

                    message = self.inbound.recv() => {
                        match message {
                            Some(bytes) => self.handle_message(&bytes),
                            None => {
                                warn!("Inbound channel closed");
                                break;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        self.report_members();
                        self.prune_tombstones();
                    }
                }
            }
        }

        if let Err(e) = self.cluster.leave(self.config.leave_timeout).await {
            error!(error = %e, "Failed leaving the cluster");
        }

        info!(stats = ?self.stats, "Reconciliation loop stopped");
        self.stats
    }

    fn handle_message(&mut self, bytes: &[u8]) {
        self.stats.received += 1;

        let Some(msg) = MutationMessage::decode(bytes) else {
            self.stats.malformed += 1;
            warn!(len = bytes.len(), "Dropping malformed broadcast message");
            return;
        };

        debug!(
            operation = %msg.operation,
            key = %msg.key,
            value_len = msg.value.len(),
            "Received broadcast message"
        );

        match apply_mutation(&self.store, &msg) {
            ApplyOutcome::Applied => self.stats.applied += 1,
            ApplyOutcome::NoOp => {}
            ApplyOutcome::Stale => {
                self.stats.stale += 1;
                debug!(key = %msg.key, "Local value is newer, ignoring broadcast");
            }
            ApplyOutcome::Ignored => {
                self.stats.ignored += 1;
                warn!(operation = %msg.operation, "Unknown operation received");
            }
        }
    }

    fn prune_tombstones(&mut self) {
        let Ok(ttl) = chrono::Duration::from_std(self.config.tombstone_ttl) else {
            return;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return;
        };
        self.stats.tombstones_pruned += self.store.prune_tombstones(cutoff) as u64;
    }

    fn report_members(&mut self) {
        self.stats.member_reports += 1;
        for member in self.cluster.members() {
            info!(member = %member.name, address = %member.endpoint(), "Cluster member");
        }
    }
}
