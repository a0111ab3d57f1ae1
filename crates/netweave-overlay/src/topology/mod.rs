//! Topology managers.
//!
//! The engine asks the active manager three questions: which peers a joiner
//! must connect to, how to reach a peer it has no channel to, and (Spray only)
//! how to maintain the partial view.

mod full_mesh;
mod spray;

use std::collections::BTreeSet;

use rand::Rng;

use netweave_core::{PeerId, TopologyKind};

pub use full_mesh::FullMesh;
pub use spray::{BroadcastLog, ChannelPlan, Spray};

/// How to deliver to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// Wrap in FORWARD_MESSAGE and hand to this neighbour.
    Relay(PeerId),
    Unreachable,
}

#[derive(Debug)]
pub enum Topology {
    FullMesh(FullMesh),
    Spray(Spray),
}

impl Topology {
    pub fn new(kind: TopologyKind, broadcast_log_capacity: usize) -> Self {
        match kind {
            TopologyKind::FullMesh => Topology::FullMesh(FullMesh),
            TopologyKind::Spray => Topology::Spray(Spray::new(broadcast_log_capacity)),
        }
    }

    pub fn kind(&self) -> TopologyKind {
        match self {
            Topology::FullMesh(_) => TopologyKind::FullMesh,
            Topology::Spray(_) => TopologyKind::Spray,
        }
    }

    /// Peers the intermediary asks a joiner to connect to, itself included.
    pub fn connect_set(&self, self_id: PeerId, members: &BTreeSet<PeerId>) -> Vec<PeerId> {
        let mut set = match self {
            Topology::FullMesh(mesh) => mesh.connect_set(members),
            Topology::Spray(spray) => spray.known_ids().into_iter().collect(),
        };
        if !set.contains(&self_id) {
            set.insert(0, self_id);
        }
        set
    }

    pub fn route<R: Rng>(&self, dest: PeerId, linked: impl Fn(PeerId) -> bool, rng: &mut R) -> Route {
        match self {
            Topology::FullMesh(mesh) => mesh.route(dest, linked),
            Topology::Spray(spray) => spray.route(dest, linked, rng),
        }
    }

    pub fn spray(&self) -> Option<&Spray> {
        match self {
            Topology::Spray(spray) => Some(spray),
            Topology::FullMesh(_) => None,
        }
    }

    pub fn spray_mut(&mut self) -> Option<&mut Spray> {
        match self {
            Topology::Spray(spray) => Some(spray),
            Topology::FullMesh(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_set_includes_intermediary() {
        let members: BTreeSet<PeerId> = [2, 3].into_iter().collect();
        let mesh = Topology::new(TopologyKind::FullMesh, 8);
        assert_eq!(mesh.connect_set(1, &members), vec![1, 2, 3]);

        let mut spray = Topology::new(TopologyKind::Spray, 8);
        spray.spray_mut().unwrap().insert_fresh(3);
        assert_eq!(spray.connect_set(1, &members), vec![1, 3]);
    }
}
