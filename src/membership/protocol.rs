//! src/membership/protocol.rs
//!
//! Pure membership algorithms, isolated from the actor and the transport so
//! they can be unit tested directly: the active-subset computation, gossip
//! target selection, and the gossip merge rule.

use crate::domain::Address;
use crate::membership::wire::GossipEntry;
use crate::membership::{MembershipEntry, MembershipTable};
use rand::{seq::SliceRandom, thread_rng};

/// The subset of the table not yet considered failed (§4.1): entries whose
/// local timestamp is no older than `t_fail_ticks`.
pub fn active_entries(table: &MembershipTable, now: i64, t_fail_ticks: i64) -> Vec<MembershipEntry> {
    table
        .iter()
        .filter(|e| now - e.local_timestamp <= t_fail_ticks)
        .cloned()
        .collect()
}

/// Selects the gossip fan-out targets for this round: shuffle the active
/// set, then take the first `floor(proportion * active.len())` of them,
/// skipping self whenever it is encountered. Self is not excluded from the
/// pool before sizing the cut — matching the source's behavior of computing
/// the count from the full active set and only skipping self inline, which
/// means a round can legitimately gossip to fewer peers than the nominal
/// count when self lands in the selected prefix.
pub fn select_gossip_targets(
    active: &[MembershipEntry],
    self_addr: Address,
    proportion: f64,
) -> Vec<Address> {
    let mut shuffled: Vec<&MembershipEntry> = active.iter().collect();
    shuffled.shuffle(&mut thread_rng());

    let count = (proportion * active.len() as f64) as usize;
    shuffled
        .into_iter()
        .take(count)
        .filter(|e| e.address != self_addr)
        .map(|e| e.address)
        .collect()
}

/// Applies the gossip merge rule (§4.1) for a single incoming entry. Returns
/// `true` if the table was changed (an insert or an accepted heartbeat bump).
pub fn merge_gossip_entry(
    table: &mut MembershipTable,
    self_addr: Address,
    sender: Address,
    entry: GossipEntry,
    now: i64,
    t_fail_ticks: i64,
    sender_equals_peer_reactivation: bool,
) -> bool {
    if entry.address == self_addr {
        return false;
    }

    match table.get(entry.address) {
        None => {
            table.insert(entry.address, entry.heartbeat, now);
            true
        }
        Some(cur) => {
            let not_expired = now - cur.local_timestamp <= t_fail_ticks;
            let sender_is_this_peer = sender_equals_peer_reactivation && sender == entry.address;
            let is_active = not_expired || sender_is_this_peer;

            if is_active && entry.heartbeat > cur.heartbeat {
                table.update_heartbeat(entry.address, entry.heartbeat, now);
                true
            } else {
                false
            }
        }
    }
}
