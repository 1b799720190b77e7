//! Process-wide flow identifier registry.
//!
//! A flow identifier names one RoQ flow on a QUIC connection, so two
//! senders in the same process must never emit with the same value. The
//! registry is a single guarded set shared by every muxer in the
//! process; claiming and releasing identifiers are its only mutating
//! operations.
//!
//! Randomly drawn identifiers stay below 2³¹ so that the implied RTCP
//! identifier (RTP identifier plus one) always fits comfortably in a
//! variable-length integer.

use std::sync::LazyLock;

use ahash::{HashSet, HashSetExt};
use parking_lot::Mutex;
use rand::Rng;

const RANDOM_DRAW_BOUND: u64 = 1 << 31;

static REGISTRY: LazyLock<Mutex<HashSet<u64>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Claim a flow identifier, returning whether it was free.
///
/// # Test
///
/// ```
/// use roq::flow;
///
/// assert!(flow::claim(0x3f00_0001));
/// assert!(!flow::claim(0x3f00_0001));
/// assert!(flow::in_use(0x3f00_0001));
///
/// flow::release(0x3f00_0001);
///
/// assert!(!flow::in_use(0x3f00_0001));
/// assert!(flow::claim(0x3f00_0001));
/// # flow::release(0x3f00_0001);
/// ```
pub fn claim(flow_id: u64) -> bool {
    REGISTRY.lock().insert(flow_id)
}

/// Release a flow identifier, if claimed.
pub fn release(flow_id: u64) {
    REGISTRY.lock().remove(&flow_id);
}

/// Whether a flow identifier is currently claimed.
pub fn in_use(flow_id: u64) -> bool {
    REGISTRY.lock().contains(&flow_id)
}

/// Draw random identifiers until one claims successfully.
pub fn allocate_random() -> u64 {
    loop {
        let flow_id = rand::rng().random_range(0..RANDOM_DRAW_BOUND);
        if claim(flow_id) {
            return flow_id;
        }
    }
}

/// Draw random identifiers until both the drawn value and its successor
/// claim successfully, as an RTP/RTCP pair.
///
/// # Test
///
/// ```
/// use roq::flow;
///
/// let (rtp, rtcp) = flow::allocate_random_pair();
///
/// assert_eq!(rtcp, rtp + 1);
/// assert!(flow::in_use(rtp));
/// assert!(flow::in_use(rtcp));
/// # flow::release(rtp);
/// # flow::release(rtcp);
/// ```
pub fn allocate_random_pair() -> (u64, u64) {
    loop {
        let flow_id = allocate_random();
        if claim(flow_id + 1) {
            return (flow_id, flow_id + 1);
        }

        release(flow_id);
    }
}

/// Every identifier currently claimed, in no particular order.
pub fn snapshot() -> Vec<u64> {
    REGISTRY.lock().iter().copied().collect()
}
