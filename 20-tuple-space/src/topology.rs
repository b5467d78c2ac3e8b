use anyhow::{Result, ensure};

use crate::{ClientId, ReplicaId};

/// Fixed replica set known to the coordinator.
///
/// Membership never changes at runtime. TAKE needs a voter pair, so at least
/// two replicas are required.
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    addrs: Vec<String>,
}

impl ReplicaTopology {
    pub fn new(addrs: Vec<String>) -> Result<Self> {
        ensure!(
            addrs.len() >= 2,
            "topology requires at least two replicas, got {}",
            addrs.len()
        );
        for (index, addr) in addrs.iter().enumerate() {
            ensure!(
                !addrs[..index].contains(addr),
                "replica address {addr} listed twice"
            );
        }
        Ok(Self { addrs })
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> {
        0..self.addrs.len()
    }

    /// The two replicas that vote on every TAKE issued by `client`.
    pub fn voters(&self, client: ClientId) -> VoterPair {
        voter_pair(client, self.len())
    }
}

/// Voter replicas for one client: `client mod R` and `(client + 1) mod R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoterPair {
    pub first: ReplicaId,
    pub second: ReplicaId,
}

impl VoterPair {
    pub fn ids(&self) -> [ReplicaId; 2] {
        [self.first, self.second]
    }
}

pub fn voter_pair(client: ClientId, replicas: usize) -> VoterPair {
    let count = replicas as u64;
    VoterPair {
        first: (client % count) as ReplicaId,
        second: ((client % count + 1) % count) as ReplicaId,
    }
}
