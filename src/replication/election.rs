use std::sync::Arc;

use arc_swap::ArcSwap;

#[cfg(test)]
use mockall::automock;

/// What the election subsystem tells us: who the primary is (if anyone)
/// and the generation counter that changes with every new primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionSnapshot {
    pub primary: Option<u32>,
    pub generation: u32,
}

/// Read-side interface onto the (external) election component. Mid-election
/// `primary()` is `None`; gap requests are suppressed and retried once a
/// primary is known again.
#[cfg_attr(test, automock)]
pub trait ElectionView: Send + Sync {
    /// This site's own eid
    fn self_eid(&self) -> u32;

    fn primary(&self) -> Option<u32>;

    fn generation(&self) -> u32;
}

/// Swappable election state for embedding: the election component calls
/// `update` whenever a new primary is established.
pub struct SharedElectionView {
    self_eid: u32,
    state: ArcSwap<ElectionSnapshot>,
}

impl SharedElectionView {
    pub fn new(self_eid: u32, snapshot: ElectionSnapshot) -> Self {
        Self {
            self_eid,
            state: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn update(&self, snapshot: ElectionSnapshot) {
        self.state.store(Arc::new(snapshot));
    }
}

impl ElectionView for SharedElectionView {
    fn self_eid(&self) -> u32 {
        self.self_eid
    }

    fn primary(&self) -> Option<u32> {
        self.state.load().primary
    }

    fn generation(&self) -> u32 {
        self.state.load().generation
    }
}
