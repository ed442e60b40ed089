// Peer identity models shared by membership, election and replication

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Lamport logical clock value
pub type ClockValue = u64;

/// Identity of a peer process
///
/// `id` is the transport address and is unique among live peers;
/// `name` is only used for display.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub id: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// A peer with the rank assigned by the reference service
///
/// Lower rank means higher election priority. Equal ranks are ordered by
/// `id`, smaller first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankedPeer {
    pub name: String,
    pub id: String,
    pub rank: i64,
}

impl RankedPeer {
    pub fn new(identity: PeerIdentity, rank: i64) -> Self {
        Self {
            name: identity.name,
            id: identity.id,
            rank,
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.name.clone(), self.id.clone())
    }

    /// Election priority order: rank first, then id
    pub fn priority_cmp(&self, other: &RankedPeer) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this peer wins an election against `other`
    pub fn outranks(&self, other: &RankedPeer) -> bool {
        self.priority_cmp(other) == Ordering::Less
    }
}
