use super::SendOutcome;
use crate::config::AckPolicy;
use crate::Lsn;

/// Acknowledgement state of one remote site, as the durability arithmetic
/// sees it. `priority == -1` means we have never completed a handshake
/// with the site, so we cannot know whether it is an electable peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteAckState {
    pub eid: u32,
    pub priority: i32,
    pub max_ack: Lsn,
}

/// Whether `lsn` currently satisfies `policy`, given each site's highest
/// acknowledged LSN. `group_size` counts every site in the group including
/// ourselves.
pub fn is_durable(policy: AckPolicy, sites: &[SiteAckState], group_size: usize, lsn: Lsn) -> bool {
    if policy == AckPolicy::None {
        return true;
    }

    let mut acked_sites = 0usize;
    let mut acked_peers = 0usize;
    let mut missing_peer = false;
    for site in sites {
        if site.priority == -1 {
            // Never connected: assume the worst, it might be a peer.
            missing_peer = true;
            continue;
        }
        if site.max_ack >= lsn {
            acked_sites += 1;
            if site.priority > 0 {
                acked_peers += 1;
            }
        } else if site.priority > 0 {
            missing_peer = true;
        }
    }

    match policy {
        AckPolicy::None => true,
        AckPolicy::One => acked_sites >= 1,
        AckPolicy::OnePeer => acked_peers >= 1,
        AckPolicy::Quorum => {
            if group_size == 2 {
                // A group of 2 is the usual special case: durability needs
                // the one other site.
                acked_peers >= 1
            } else {
                acked_peers >= (group_size - 1) / 2
            }
        }
        AckPolicy::All => acked_sites >= group_size - 1,
        AckPolicy::AllPeers => {
            if sites.len() < group_size - 1 {
                // A site we have not even heard of might be a peer.
                return false;
            }
            !missing_peer
        }
    }
}

/// Upfront check for a durability wait: with only `attempted` sites having
/// been sent the record, could enough acknowledgements ever arrive? When
/// not, the wait fails fast with "unavailable" instead of blocking out its
/// full timeout.
pub fn enough_potential_acks(policy: AckPolicy, attempted: SendOutcome, group_size: usize) -> bool {
    let (needed, available) = match policy {
        AckPolicy::None => return true,
        AckPolicy::One => (1, attempted.sites),
        AckPolicy::All => (group_size as u32 - 1, attempted.sites),
        AckPolicy::OnePeer => (1, attempted.peers),
        // Without a peer census we cannot size "all peers"; take any peer
        // as potentially enough and let the wait itself decide.
        AckPolicy::AllPeers => (1, attempted.peers),
        AckPolicy::Quorum => ((group_size as u32 - 1) / 2, attempted.peers),
    };
    available >= needed
}
