//! The boundary with the host simulation.
//!
//! The core reads orbital state through [`Host`] and writes maneuver
//! nodes and warp requests back through it. Everything the host owns
//! (bodies, vessels, nodes) is looked up by name or id on every use;
//! nothing here holds on to host objects.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration as StdDuration,
};

use color_eyre::eyre;
use nalgebra::Vector3;
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};

use crate::{
    arena::IdLike,
    bodies::SolarSystem,
    destination::Destination,
    kepler::orbits::Orbit,
    time::UT,
    vessel::{Vessel, VesselId},
};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(u64);

impl IdLike for NodeId {
    fn from_raw(index: usize) -> Self {
        Self(index as u64)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

/// A maneuver node as the host stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManeuverNode {
    pub ut: UT,
    /// Delta-V in the (prograde, normal, radial) frame at `ut`.
    pub deltav: Vector3<f64>,
}

/// Modifier-key state at the time of an input event.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// Fine adjustment requested (the host's precision modifier is held).
    pub fine: bool,
}

pub trait Host {
    fn universal_time(&self) -> UT;

    fn system(&self) -> &SolarSystem;

    fn vessel(&self, id: VesselId) -> Option<&Vessel>;

    /// Every vessel and asteroid the host tracks.
    fn vessels(&self) -> Vec<VesselId>;

    fn active_vessel(&self) -> Option<VesselId>;

    /// The active vessel's current target.
    fn target(&self) -> Option<Destination>;

    fn modifiers(&self) -> Modifiers;

    /// The active vessel's maneuver nodes, in time order.
    fn nodes(&self) -> Vec<NodeId>;

    fn node(&self, id: NodeId) -> Option<ManeuverNode>;

    fn create_node(&mut self, ut: UT, deltav: Vector3<f64>) -> eyre::Result<NodeId>;

    fn update_node(&mut self, id: NodeId, deltav: Vector3<f64>) -> eyre::Result<()>;

    fn remove_node(&mut self, id: NodeId) -> eyre::Result<()>;

    /// The patched trajectory following node `id`, taking every
    /// earlier node into account. Each patch's epoch is the time it
    /// begins.
    fn node_trajectory(&self, id: NodeId) -> eyre::Result<Vec<Orbit>>;

    fn warp_to(&mut self, ut: UT) -> eyre::Result<()>;
}

/// Exclusive use of a host for one plane-change calculation.
pub trait HostLease {
    type Host: Host;

    fn host(&mut self) -> &mut Self::Host;

    /// Let the host's trajectory solver catch up between node edits.
    fn settle(&mut self) {}

    /// Whether the calculation has been superseded.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<H: Host> HostLease for &mut H {
    type Host = H;

    fn host(&mut self) -> &mut H {
        self
    }
}

/// A lease on a host shared with the simulation thread. The lock is
/// released while settling so the simulation keeps ticking.
pub struct LockedHost<'a, H> {
    guard: MutexGuard<'a, H>,
    settle: StdDuration,
    generation: &'a AtomicU64,
    expected: u64,
}

impl<'a, H> LockedHost<'a, H> {
    pub fn new(
        guard: MutexGuard<'a, H>,
        settle: StdDuration,
        generation: &'a AtomicU64,
        expected: u64,
    ) -> Self {
        Self {
            guard,
            settle,
            generation,
            expected,
        }
    }
}

impl<H: Host> HostLease for LockedHost<'_, H> {
    type Host = H;

    fn host(&mut self) -> &mut H {
        &mut self.guard
    }

    fn settle(&mut self) {
        let delay = self.settle;
        MutexGuard::unlocked(&mut self.guard, || thread::sleep(delay));
    }

    fn is_cancelled(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.expected
    }
}
