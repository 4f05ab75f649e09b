//! Scoped ownership of maneuver nodes created only to query the host.

use color_eyre::eyre::{self, OptionExt};
use nalgebra::Vector3;
use tracing::warn;

use crate::{
    host::{Host, HostLease, ManeuverNode, NodeId},
    kepler::orbits::Orbit,
    time::UT,
};

/// Every node created through this scope is removed again when it is
/// dropped, whichever way the scope is left, unless the nodes were
/// handed over with [`TransientNodes::commit`]. Nodes set aside with
/// [`TransientNodes::stash`] are put back the same way.
pub struct TransientNodes<'l, L: HostLease> {
    lease: &'l mut L,
    created: Vec<NodeId>,
    stashed: Vec<(NodeId, ManeuverNode)>,
}

impl<'l, L: HostLease> TransientNodes<'l, L> {
    pub fn new(lease: &'l mut L) -> Self {
        Self {
            lease,
            created: Vec::new(),
            stashed: Vec::new(),
        }
    }

    pub fn host(&mut self) -> &mut L::Host {
        self.lease.host()
    }

    pub fn create(&mut self, ut: UT, deltav: Vector3<f64>) -> eyre::Result<NodeId> {
        let id = self.lease.host().create_node(ut, deltav)?;
        self.created.push(id);
        Ok(id)
    }

    pub fn update(&mut self, id: NodeId, deltav: Vector3<f64>) -> eyre::Result<()> {
        self.lease.host().update_node(id, deltav)
    }

    pub fn trajectory(&mut self, id: NodeId) -> eyre::Result<Vec<Orbit>> {
        self.lease.host().node_trajectory(id)
    }

    pub fn settle(&mut self) {
        self.lease.settle();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// Take a node off the vessel for the lifetime of the scope.
    pub fn stash(&mut self, id: NodeId) -> eyre::Result<()> {
        let node = self.lease.host().node(id).ok_or_eyre("no such maneuver node")?;
        self.lease.host().remove_node(id)?;
        self.stashed.push((id, node));
        Ok(())
    }

    /// Keep the created nodes; they become the caller's to manage.
    pub fn commit(mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.created)
    }

    /// Remove the created nodes and put the stashed ones back. The host
    /// hands out fresh ids, so this returns `(old, new)` for each node
    /// that came back.
    pub fn restore(mut self) -> Vec<(NodeId, NodeId)> {
        self.clean_up()
    }

    fn clean_up(&mut self) -> Vec<(NodeId, NodeId)> {
        while let Some(id) = self.created.pop() {
            if let Err(error) = self.lease.host().remove_node(id) {
                warn!(?id, %error, "failed to remove transient maneuver node");
            }
        }
        let mut restored = Vec::with_capacity(self.stashed.len());
        for (old, node) in self.stashed.drain(..) {
            match self.lease.host().create_node(node.ut, node.deltav) {
                Ok(new) => restored.push((old, new)),
                Err(error) => warn!(?old, %error, "failed to restore stashed maneuver node"),
            }
        }
        restored
    }
}

impl<L: HostLease> Drop for TransientNodes<'_, L> {
    fn drop(&mut self) {
        let restored = self.clean_up();
        if !restored.is_empty() {
            warn!(count = restored.len(), "stashed maneuver nodes restored under new ids");
        }
    }
}
