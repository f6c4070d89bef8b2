//! Membership providers
//!
//! - [`udp`]: gossip over UDP with TCP join and state exchange
//! - [`local`]: in-process network for tests and single-binary demos

pub mod local;
pub mod udp;

use rand::seq::{IndexedRandom, SliceRandom};

pub use local::{LocalMembership, LocalNetwork};
pub use udp::{UdpConfig, UdpMembership, UdpTransport};

/// Conventional safe UDP payload size.
pub const DEFAULT_PACKET_SIZE: usize = 1400;

/// Up to `k` items in random order.
pub(crate) fn random_subset<T: Clone>(items: &[T], k: usize) -> Vec<T> {
    let mut rng = rand::rng();
    if k >= items.len() {
        let mut all = items.to_vec();
        all.shuffle(&mut rng);
        return all;
    }
    items.choose_multiple(&mut rng, k).cloned().collect()
}
