//! A self-contained host: bodies, vessels and maneuver nodes in
//! memory, with node trajectories by patched conics.

use color_eyre::eyre::{self, bail, OptionExt};
use itertools::Itertools;
use nalgebra::Vector3;
use time::Duration;

use crate::{
    arena::Arena,
    bodies::SolarSystem,
    burn,
    destination::Destination,
    host::{Host, ManeuverNode, Modifiers, NodeId},
    kepler::orbits::{Orbit, StateVector},
    time::UT,
    vessel::{Vessel, VesselId},
};

/// Most patches a node trajectory is followed through.
pub const MAX_PATCHES: usize = 4;

#[derive(Clone, Debug, Default)]
pub struct SimHost {
    pub system: SolarSystem,
    pub now: UT,
    pub modifiers: Modifiers,
    vessels: Arena<VesselId, Vessel>,
    nodes: Arena<NodeId, ManeuverNode>,
    active: Option<VesselId>,
    target: Option<Destination>,
}

impl SimHost {
    pub fn new(system: SolarSystem, now: UT) -> Self {
        Self {
            system,
            now,
            ..Self::default()
        }
    }

    pub fn add_vessel(&mut self, vessel: Vessel) -> VesselId {
        self.vessels.push(vessel)
    }

    pub fn vessel_mut(&mut self, id: VesselId) -> Option<&mut Vessel> {
        self.vessels.get_mut(id)
    }

    pub fn set_active(&mut self, id: Option<VesselId>) {
        self.active = id;
    }

    pub fn set_target(&mut self, target: Option<Destination>) {
        self.target = target;
    }

    pub fn advance(&mut self, dt: Duration) {
        self.now += dt;
    }

    fn mu(&self, body: &str) -> eyre::Result<f64> {
        self.system
            .get(body)
            .map(|b| b.mu)
            .ok_or_else(|| eyre::eyre!("unknown body {body}"))
    }

    /// The SOI exit following `after`, and the orbit around the parent
    /// body that continues from it.
    fn exit(&self, orbit: &Orbit, after: UT) -> eyre::Result<Option<(UT, Orbit)>> {
        let body = self
            .system
            .get(&orbit.body)
            .ok_or_else(|| eyre::eyre!("unknown body {}", orbit.body))?;
        let (Some(parent), Some(body_orbit)) = (self.system.parent(&body.name), &body.orbit)
        else {
            return Ok(None);
        };
        let Some(t) = orbit.soi_exit_time(body.soi, after, body.mu) else {
            return Ok(None);
        };
        let inner = orbit.state_at(t, body.mu);
        let outer = body_orbit.state_at(t, parent.mu);
        let sv = StateVector {
            body: parent.name.clone(),
            mu: parent.mu,
            position: inner.position + outer.position,
            velocity: inner.velocity + outer.velocity,
            time: t,
        };
        Ok(Some((t, sv.into_orbit(1e-8))))
    }

    /// The patch an orbiter starting on `orbit` at `from` is on at `ut`.
    fn patch_at(&self, mut orbit: Orbit, mut from: UT, ut: UT) -> eyre::Result<Orbit> {
        for _ in 0..MAX_PATCHES {
            match self.exit(&orbit, from)? {
                Some((t, next)) if t <= ut => {
                    orbit = next;
                    from = t;
                }
                _ => break,
            }
        }
        Ok(orbit)
    }

    fn patches(&self, orbit: Orbit, mut from: UT) -> eyre::Result<Vec<Orbit>> {
        let mut patches = vec![orbit];
        while patches.len() < MAX_PATCHES {
            let Some(last) = patches.last() else { break };
            let Some((t, next)) = self.exit(last, from)? else {
                break;
            };
            patches.push(next);
            from = t;
        }
        Ok(patches)
    }
}

impl Host for SimHost {
    fn universal_time(&self) -> UT {
        self.now
    }

    fn system(&self) -> &SolarSystem {
        &self.system
    }

    fn vessel(&self, id: VesselId) -> Option<&Vessel> {
        self.vessels.get(id)
    }

    fn vessels(&self) -> Vec<VesselId> {
        self.vessels.ids().collect()
    }

    fn active_vessel(&self) -> Option<VesselId> {
        self.active
    }

    fn target(&self) -> Option<Destination> {
        self.target.clone()
    }

    fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .sorted_by_key(|(id, node)| (node.ut, *id))
            .map(|(id, _)| id)
            .collect()
    }

    fn node(&self, id: NodeId) -> Option<ManeuverNode> {
        self.nodes.get(id).cloned()
    }

    fn create_node(&mut self, ut: UT, deltav: Vector3<f64>) -> eyre::Result<NodeId> {
        self.active.ok_or_eyre("no active vessel")?;
        if !deltav.iter().all(|x| x.is_finite()) {
            bail!("delta-V is not finite");
        }
        Ok(self.nodes.push(ManeuverNode { ut, deltav }))
    }

    fn update_node(&mut self, id: NodeId, deltav: Vector3<f64>) -> eyre::Result<()> {
        if !deltav.iter().all(|x| x.is_finite()) {
            bail!("delta-V is not finite");
        }
        self.nodes
            .get_mut(id)
            .ok_or_eyre("no such maneuver node")?
            .deltav = deltav;
        Ok(())
    }

    fn remove_node(&mut self, id: NodeId) -> eyre::Result<()> {
        self.nodes
            .remove(id)
            .map(|_| ())
            .ok_or_eyre("no such maneuver node")
    }

    fn node_trajectory(&self, id: NodeId) -> eyre::Result<Vec<Orbit>> {
        let vessel = self
            .active
            .and_then(|a| self.vessels.get(a))
            .ok_or_eyre("no active vessel")?;
        if !self.nodes.contains(id) {
            bail!("no such maneuver node");
        }

        let mut orbit = vessel.orbit.clone();
        let mut from = self.now;
        for node_id in self.nodes() {
            let node = &self.nodes[node_id];
            orbit = self.patch_at(orbit, from, node.ut)?;
            let mu = self.mu(&orbit.body)?;
            let mut sv = orbit.state_at(node.ut, mu);
            sv.velocity += burn::to_inertial(&sv, node.deltav);
            orbit = sv.into_orbit(1e-8);
            from = node.ut;
            if node_id == id {
                break;
            }
        }
        self.patches(orbit, from)
    }

    fn warp_to(&mut self, ut: UT) -> eyre::Result<()> {
        if ut < self.now {
            bail!("cannot warp into the past");
        }
        self.now = ut;
        Ok(())
    }
}
