use color_eyre::eyre;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    host::{Host, ManeuverNode, Modifiers, NodeId},
    kepler::orbits::StateVector,
    time::UT,
};

/// Tolerance when comparing a burn against the node the host reports.
const NODE_TIME_TOL: f64 = 1e-3;
const NODE_DELTAV_TOL: f64 = 1e-6;

/// Step size of a manual nudge.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Increment {
    Fine,
    Coarse,
}

impl Increment {
    /// Metres per second per unit of adjustment.
    pub fn step(self) -> f64 {
        match self {
            Self::Fine => 0.1,
            Self::Coarse => 1.0,
        }
    }
}

impl From<Modifiers> for Increment {
    fn from(modifiers: Modifiers) -> Self {
        if modifiers.fine {
            Self::Fine
        } else {
            Self::Coarse
        }
    }
}

/// A single maneuver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Burn {
    pub ut: UT,
    /// Delta-V vector in the Frenet (prograde, normal, radial) frame.
    pub deltav: Vector3<f64>,
    /// The host node this burn was turned into, if any. The host may
    /// delete it at any time.
    pub node: Option<NodeId>,
}

/// Burns compare by value; the node link is bookkeeping.
impl PartialEq for Burn {
    fn eq(&self, other: &Self) -> bool {
        self.ut == other.ut && self.deltav == other.deltav
    }
}

impl Burn {
    pub fn new(ut: UT, deltav: Vector3<f64>) -> Self {
        Self {
            ut,
            deltav,
            node: None,
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.deltav.norm()
    }

    /// The burn window has passed.
    pub fn is_stale(&self, now: UT) -> bool {
        self.ut < now
    }

    /// Whether `node` carries this burn's time and delta-V.
    pub fn matches(&self, node: &ManeuverNode) -> bool {
        (node.ut - self.ut).as_seconds_f64().abs() <= NODE_TIME_TOL
            && (node.deltav - self.deltav).norm() <= NODE_DELTAV_TOL
    }

    /// The linked node, if the host still has it. A vanished node
    /// unlinks the burn.
    pub fn linked_node<H: Host + ?Sized>(&mut self, host: &H) -> Option<NodeId> {
        let id = self.node?;
        if host.node(id).is_some() {
            Some(id)
        } else {
            tracing::debug!(?id, "maneuver node is gone, unlinking burn");
            self.node = None;
            None
        }
    }

    /// Nudge the linked node by `direction * fraction` steps, the step
    /// size chosen by the host's modifier keys. Returns whether a node
    /// was changed; an unlinked burn is left alone.
    pub fn adjust<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        direction: Vector3<f64>,
        fraction: f64,
    ) -> eyre::Result<bool> {
        let Some(id) = self.linked_node(host) else {
            return Ok(false);
        };
        let step = Increment::from(host.modifiers()).step();
        let deltav = self.deltav + direction * fraction * step;
        host.update_node(id, deltav)?;
        self.deltav = deltav;
        Ok(true)
    }
}

/// Returns the Frenet frame to body-centered inertial conversion
/// matrix for the given state vector.
pub fn frenet(sv: &StateVector) -> Matrix3<f64> {
    let t = sv.velocity.normalize();
    let n = sv.position.cross(&sv.velocity).normalize();
    let b = t.cross(&n);
    Matrix3::from_columns(&[t, n, b])
}

pub fn to_inertial(sv: &StateVector, deltav: Vector3<f64>) -> Vector3<f64> {
    frenet(sv) * deltav
}

pub fn from_inertial(sv: &StateVector, deltav: Vector3<f64>) -> Vector3<f64> {
    frenet(sv).transpose() * deltav
}
