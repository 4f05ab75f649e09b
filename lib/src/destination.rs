//! What a transfer starts from and where it goes.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    bodies::Body,
    host::Host,
    kepler::orbits::Orbit,
    vessel::{Situation, Vessel, VesselId},
};

/// Anything that can be the far end of a transfer.
pub trait Orbiting {
    fn name(&self) -> &Arc<str>;
    /// The orbit a transfer can aim at, if there is a usable one.
    fn orbit(&self) -> Option<&Orbit>;
    fn situation(&self) -> Situation;
}

impl Orbiting for Body {
    fn name(&self) -> &Arc<str> {
        &self.name
    }

    fn orbit(&self) -> Option<&Orbit> {
        self.orbit.as_ref()
    }

    fn situation(&self) -> Situation {
        Situation::Orbiting
    }
}

impl Orbiting for Vessel {
    fn name(&self) -> &Arc<str> {
        &self.name
    }

    fn orbit(&self) -> Option<&Orbit> {
        (self.situation == Situation::Orbiting).then_some(&self.orbit)
    }

    fn situation(&self) -> Situation {
        self.situation
    }
}

/// Identity of a transfer's destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Body(Arc<str>),
    Vessel(VesselId),
}

impl Destination {
    pub fn resolve<'h, H: Host + ?Sized>(&self, host: &'h H) -> Option<&'h dyn Orbiting> {
        match self {
            Self::Body(name) => host.system().get(name).map(|b| &**b as &dyn Orbiting),
            Self::Vessel(id) => host.vessel(*id).map(|v| v as &dyn Orbiting),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(name) => write!(f, "{name}"),
            Self::Vessel(id) => write!(f, "{id:?}"),
        }
    }
}

/// Where transfers start from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// A vessel in a closed orbit.
    Vessel(VesselId),
    /// A body, departing from a parking orbit around it.
    Body(Arc<str>),
}

impl Origin {
    /// The origin implied by the host's active vessel: the vessel
    /// itself when orbiting, its body when on or near the surface.
    pub fn of_active_vessel<H: Host + ?Sized>(host: &H) -> Option<Self> {
        let id = host.active_vessel()?;
        let vessel = host.vessel(id)?;
        match vessel.situation {
            Situation::Orbiting if vessel.orbit.is_elliptic() => Some(Self::Vessel(id)),
            s if s.is_grounded() => Some(Self::Body(vessel.body().clone())),
            _ => None,
        }
    }

    /// The body whose satellites are the origin's nearest neighbours.
    pub fn reference_body<H: Host + ?Sized>(&self, host: &H) -> Option<Arc<str>> {
        match self {
            Self::Vessel(id) => host.vessel(*id).map(|v| v.body().clone()),
            Self::Body(name) => Some(name.clone()),
        }
    }
}
