//! Scenario files: a solar system, vessels and the active vessel's
//! state, written in RON with angles in degrees.

use std::{collections::HashMap, path::Path, sync::Arc};

use astrogator::{
    bodies::{Body, SolarSystem},
    destination::Destination,
    host::Host,
    kepler::orbits::Orbit,
    sim::SimHost,
    time::UT,
    vessel::{Situation, Vessel, VesselId, VesselKind},
};
use color_eyre::eyre::{self, bail, eyre, WrapErr};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Elements {
    pub sma: f64,
    #[serde(default)]
    pub e: f64,
    #[serde(default)]
    pub inclination: f64,
    #[serde(default)]
    pub lan: f64,
    #[serde(default)]
    pub argpe: f64,
    #[serde(default)]
    pub mean_anomaly: f64,
    #[serde(default)]
    pub epoch: f64,
}

impl Elements {
    fn into_orbit(self, body: &str) -> Orbit {
        Orbit {
            sma: self.sma,
            e: self.e,
            i: self.inclination.to_radians(),
            lan: self.lan.to_radians(),
            argpe: self.argpe.to_radians(),
            mae: self.mean_anomaly.to_radians(),
            epoch: UT::new_seconds(self.epoch),
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BodyConfig {
    pub name: String,
    pub parent: Option<String>,
    pub mu: f64,
    pub radius: f64,
    #[serde(default)]
    pub atmosphere_depth: f64,
    pub soi: Option<f64>,
    pub orbit: Option<Elements>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VesselConfig {
    pub name: String,
    pub kind: VesselKind,
    pub situation: Situation,
    pub body: String,
    pub orbit: Elements,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TargetConfig {
    Body(String),
    Vessel(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub ut: f64,
    /// (prograde, normal, radial), m/s
    pub deltav: (f64, f64, f64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub now: f64,
    pub bodies: Vec<BodyConfig>,
    #[serde(default)]
    pub vessels: Vec<VesselConfig>,
    pub active: Option<String>,
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Scenario {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading scenario {}", path.display()))?;
        ron::from_str(&text).wrap_err_with(|| format!("parsing scenario {}", path.display()))
    }

    pub fn into_host(self) -> eyre::Result<SimHost> {
        let mut bodies = Vec::new();
        for config in self.bodies {
            let soi = match (&config.parent, config.soi) {
                (_, Some(soi)) => soi,
                (None, None) => f64::INFINITY,
                (Some(_), None) => bail!("body {} needs an SOI radius", config.name),
            };
            let orbit = match (&config.parent, config.orbit) {
                (Some(parent), Some(elements)) => Some(elements.into_orbit(parent)),
                (Some(_), None) => bail!("body {} has a parent but no orbit", config.name),
                (None, _) => None,
            };
            bodies.push(Body {
                name: config.name.as_str().into(),
                mu: config.mu,
                radius: config.radius,
                atmosphere_depth: config.atmosphere_depth,
                soi,
                orbit,
                is_star: config.parent.is_none(),
                parent: config.parent.map(Into::into),
                satellites: Vec::new(),
            });
        }
        let system = SolarSystem::from_bodies(bodies);

        let mut host = SimHost::new(system, UT::new_seconds(self.now));
        let mut names: HashMap<Arc<str>, VesselId> = HashMap::new();
        for config in self.vessels {
            if host.system.get(&config.body).is_none() {
                bail!("vessel {} orbits unknown body {}", config.name, config.body);
            }
            let name: Arc<str> = config.name.as_str().into();
            let id = host.add_vessel(Vessel {
                name: name.clone(),
                kind: config.kind,
                situation: config.situation,
                orbit: config.orbit.into_orbit(&config.body),
            });
            names.insert(name, id);
        }

        let lookup = |name: &str| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| eyre!("no vessel named {name}"))
        };
        if let Some(active) = &self.active {
            host.set_active(Some(lookup(active)?));
        }
        let target = match self.target {
            Some(TargetConfig::Body(name)) => Some(Destination::Body(name.as_str().into())),
            Some(TargetConfig::Vessel(name)) => Some(Destination::Vessel(lookup(&name)?)),
            None => None,
        };
        host.set_target(target);
        for node in self.nodes {
            let (x, y, z) = node.deltav;
            host.create_node(UT::new_seconds(node.ut), Vector3::new(x, y, z))?;
        }
        Ok(host)
    }
}
