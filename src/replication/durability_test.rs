use super::enough_potential_acks;
use super::is_durable;
use super::SendOutcome;
use super::SiteAckState;
use crate::config::AckPolicy;
use crate::Lsn;

fn site(eid: u32, priority: i32, max_ack: Lsn) -> SiteAckState {
    SiteAckState {
        eid,
        priority,
        max_ack,
    }
}

const TARGET: Lsn = Lsn::new(3, 128);

/// # Case 1: the none policy is always satisfied
#[test]
fn test_none_always_durable() {
    assert!(is_durable(AckPolicy::None, &[], 5, TARGET));
}

/// # Case 2: one site's ack satisfies One regardless of priority
#[test]
fn test_one_any_site() {
    let sites = [site(0, 0, TARGET), site(1, 2, Lsn::ZERO)];
    assert!(is_durable(AckPolicy::One, &sites, 3, TARGET));
    assert!(!is_durable(AckPolicy::OnePeer, &sites, 3, TARGET));
}

/// # Case 3: OnePeer needs an electable acker
#[test]
fn test_one_peer_needs_electable() {
    let sites = [site(0, 1, TARGET)];
    assert!(is_durable(AckPolicy::OnePeer, &sites, 2, TARGET));
    let ack_below = [site(0, 1, Lsn::new(3, 64))];
    assert!(!is_durable(AckPolicy::OnePeer, &ack_below, 2, TARGET));
}

/// # Case 4: a group of two needs the one other site, not a vacuous
/// majority
#[test]
fn test_quorum_two_site_special_case() {
    let not_acked = [site(0, 1, Lsn::ZERO)];
    assert!(!is_durable(AckPolicy::Quorum, &not_acked, 2, TARGET));
    let acked = [site(0, 1, TARGET)];
    assert!(is_durable(AckPolicy::Quorum, &acked, 2, TARGET));
}

/// # Case 5: a five-site group needs two acking peers
#[test]
fn test_quorum_five_sites() {
    let one_peer = [
        site(0, 1, TARGET),
        site(1, 1, Lsn::ZERO),
        site(2, 0, TARGET),
        site(3, 1, Lsn::ZERO),
    ];
    assert!(!is_durable(AckPolicy::Quorum, &one_peer, 5, TARGET));
    let two_peers = [
        site(0, 1, TARGET),
        site(1, 1, TARGET),
        site(2, 0, Lsn::ZERO),
        site(3, 1, Lsn::ZERO),
    ];
    assert!(is_durable(AckPolicy::Quorum, &two_peers, 5, TARGET));
}

/// # Case 6: All counts every site besides ourselves
#[test]
fn test_all_counts_whole_group() {
    let sites = [site(0, 0, TARGET), site(1, 1, TARGET)];
    assert!(is_durable(AckPolicy::All, &sites, 3, TARGET));
    let partial = [site(0, 0, TARGET), site(1, 1, Lsn::ZERO)];
    assert!(!is_durable(AckPolicy::All, &partial, 3, TARGET));
}

/// # Case 7: a never-connected site blocks AllPeers since it might be a peer
#[test]
fn test_all_peers_conservative_about_unknown_sites() {
    let sites = [site(0, 1, TARGET), site(1, -1, Lsn::ZERO)];
    assert!(!is_durable(AckPolicy::AllPeers, &sites, 3, TARGET));
    let known = [site(0, 1, TARGET), site(1, 0, Lsn::ZERO)];
    assert!(is_durable(AckPolicy::AllPeers, &known, 3, TARGET));
}

/// # Case 8: AllPeers with sites we have not even heard of yet
#[test]
fn test_all_peers_partial_census() {
    let sites = [site(0, 1, TARGET)];
    assert!(!is_durable(AckPolicy::AllPeers, &sites, 3, TARGET));
}

/// # Case 9: higher LSNs acked cover lower targets
#[test]
fn test_ack_covers_lower_lsns() {
    let sites = [site(0, 1, Lsn::new(4, 0))];
    assert!(is_durable(AckPolicy::One, &sites, 2, Lsn::new(3, 128)));
}

/// # Case 10: the fast-fail table mirrors what could ever be satisfied
#[test]
fn test_fast_fail_table() {
    let none = SendOutcome::default();
    assert!(enough_potential_acks(AckPolicy::None, none, 5));
    assert!(!enough_potential_acks(AckPolicy::One, none, 5));
    assert!(!enough_potential_acks(AckPolicy::Quorum, none, 5));

    let one_logger = SendOutcome { sites: 1, peers: 0 };
    assert!(enough_potential_acks(AckPolicy::One, one_logger, 5));
    assert!(!enough_potential_acks(AckPolicy::OnePeer, one_logger, 5));

    let two_peers = SendOutcome { sites: 3, peers: 2 };
    assert!(enough_potential_acks(AckPolicy::Quorum, two_peers, 5));
    assert!(!enough_potential_acks(AckPolicy::All, two_peers, 5));
    assert!(enough_potential_acks(AckPolicy::All, SendOutcome { sites: 4, peers: 2 }, 5));
}
