use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{arena::IdLike, kepler::orbits::Orbit};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct VesselId(u64);

impl IdLike for VesselId {
    fn from_raw(index: usize) -> Self {
        Self(index as u64)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VesselKind {
    Ship,
    Probe,
    Station,
    Asteroid,
    Debris,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Situation {
    PreLaunch,
    Landed,
    Splashed,
    Flying,
    SubOrbital,
    Orbiting,
    Escaping,
    Docked,
}

impl Situation {
    /// On or near the surface: transfers start from a parking orbit
    /// around the body.
    pub fn is_grounded(self) -> bool {
        matches!(
            self,
            Self::PreLaunch | Self::Landed | Self::Splashed | Self::Flying | Self::SubOrbital
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vessel {
    pub name: Arc<str>,
    pub kind: VesselKind,
    pub situation: Situation,
    pub orbit: Orbit,
}

impl Vessel {
    /// Name of the body this vessel is orbiting or sitting on.
    pub fn body(&self) -> &Arc<str> {
        &self.orbit.body
    }
}
