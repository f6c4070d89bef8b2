//! Retransmit-limited broadcast queue
//!
//! Mutations are queued here by the local write path and piggybacked on
//! gossip packets by the membership provider. Each entry is handed out a
//! bounded number of times, scaled with the cluster size, and then dropped.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::MutationMessage;

/// Default multiplier applied to the cluster-size scale factor.
pub const DEFAULT_RETRANSMIT_MULT: usize = 3;

/// Number of times a broadcast is handed out for a cluster of `live_nodes`.
///
/// `retransmit_mult * ceil(log10(live_nodes + 1))`, never less than one so a
/// mutation made before any membership event still gets a transmission.
pub fn retransmit_limit(retransmit_mult: usize, live_nodes: usize) -> usize {
    let scale = ((live_nodes + 1) as f64).log10().ceil() as usize;
    (retransmit_mult * scale).max(1)
}

/// A queued, already-encoded broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEntry {
    payload: Vec<u8>,
    transmits_remaining: usize,
}

impl BroadcastEntry {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn transmits_remaining(&self) -> usize {
        self.transmits_remaining
    }

    /// Whether this entry supersedes `other`. Never: every mutation is
    /// delivered on its own, even a later write to the same key.
    pub fn invalidates(&self, _other: &BroadcastEntry) -> bool {
        false
    }
}

/// FIFO queue of pending broadcasts.
///
/// The queue has no capacity bound; callers are expected to keep the mutation
/// rate in proportion to the gossip rate.
#[derive(Debug)]
pub struct BroadcastQueue {
    queue: Mutex<VecDeque<BroadcastEntry>>,
    live_nodes: Arc<AtomicUsize>,
    retransmit_mult: usize,
}

impl BroadcastQueue {
    pub fn new(live_nodes: Arc<AtomicUsize>, retransmit_mult: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            live_nodes,
            retransmit_mult,
        }
    }

    /// Transmission budget a broadcast queued right now would get.
    pub fn retransmit_limit(&self) -> usize {
        retransmit_limit(self.retransmit_mult, self.live_nodes.load(Ordering::Acquire))
    }

    /// Encode and enqueue a mutation. Never blocks.
    pub fn queue_broadcast(&self, msg: &MutationMessage) -> bool {
        self.queue_payload(msg.encode())
    }

    /// Enqueue an encoded payload. Empty payloads are discarded.
    pub fn queue_payload(&self, payload: Vec<u8>) -> bool {
        if payload.is_empty() {
            return false;
        }
        let entry = BroadcastEntry {
            payload,
            transmits_remaining: self.retransmit_limit(),
        };

        let mut queue = self.queue.lock();
        queue.retain(|existing| !entry.invalidates(existing));
        trace!(
            transmits = entry.transmits_remaining,
            queued = queue.len() + 1,
            "Queued broadcast"
        );
        queue.push_back(entry);
        true
    }

    /// Select payloads for one outgoing packet.
    ///
    /// Entries are visited oldest first. Each selected entry costs
    /// `overhead + payload.len()` bytes against `limit`; entries that do not
    /// fit are skipped so smaller ones behind them can still go out. Selected
    /// entries lose one transmission and are evicted when none remain.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        let mut used = 0usize;
        let mut selected = Vec::new();
        queue.retain_mut(|entry| {
            let cost = overhead + entry.payload.len();
            if used + cost > limit {
                return true;
            }
            used += cost;
            selected.push(entry.payload.clone());
            entry.transmits_remaining = entry.transmits_remaining.saturating_sub(1);
            entry.transmits_remaining > 0
        });

        if !selected.is_empty() {
            debug!(
                selected = selected.len(),
                bytes = used,
                remaining = queue.len(),
                "Drained broadcasts for transmission"
            );
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop every pending broadcast.
    pub fn reset(&self) {
        self.queue.lock().clear();
    }

    /// Copy of the pending entries, oldest first.
    pub fn pending(&self) -> Vec<BroadcastEntry> {
        self.queue.lock().iter().cloned().collect()
    }
}
