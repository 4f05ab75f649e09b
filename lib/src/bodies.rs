//! Definitions of celestial bodies.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::kepler::orbits::Orbit;

/// A celestial body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Name of this body as displayed in KSP
    pub name: Arc<str>,
    /// Standard gravitational parameter (`m^3/s^2`)
    pub mu: f64,
    /// Mean radius of the body's sphere (`m`)
    pub radius: f64,
    /// Height of the atmosphere above `radius`, zero if airless (`m`)
    pub atmosphere_depth: f64,
    /// Radius of this body's sphere of influence (`m`)
    pub soi: f64,
    /// Orbit around the parent body; `None` for the star.
    pub orbit: Option<Orbit>,
    /// The name of the parent body of this body, if any.
    pub parent: Option<Arc<str>>,
    /// A list of names of bodies orbiting this body.
    pub satellites: Vec<Arc<str>>,
    /// Is this a star?
    pub is_star: bool,
}

impl Body {
    /// Radius of a sensible circular parking orbit: 10km above the
    /// atmosphere or 30km above the surface, whichever is higher.
    pub fn parking_radius(&self) -> f64 {
        self.radius + (self.atmosphere_depth + 10_000.0).max(30_000.0)
    }
}

/// The reference-body tree, rooted at the star.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SolarSystem {
    pub bodies: HashMap<Arc<str>, Arc<Body>>,
}

impl SolarSystem {
    /// Build a system from bodies whose `parent` links are set,
    /// filling in every body's `satellites`.
    pub fn from_bodies(bodies: impl IntoIterator<Item = Body>) -> Self {
        let mut bodies: HashMap<Arc<str>, Body> =
            bodies.into_iter().map(|b| (b.name.clone(), b)).collect();
        let links: Vec<(Arc<str>, Arc<str>)> = bodies
            .values()
            .filter_map(|b| Some((b.parent.clone()?, b.name.clone())))
            .collect();
        for body in bodies.values_mut() {
            body.satellites.clear();
        }
        for (parent, child) in links {
            if let Some(parent) = bodies.get_mut(&parent) {
                parent.satellites.push(child);
            }
        }
        for body in bodies.values_mut() {
            body.satellites.sort();
        }
        Self {
            bodies: bodies.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Body>> {
        self.bodies.get(name)
    }

    pub fn parent(&self, name: &str) -> Option<&Arc<Body>> {
        self.get(name)?.parent.as_deref().and_then(|p| self.get(p))
    }

    /// `name` followed by its ancestors, ending at the root.
    pub fn chain(&self, name: &str) -> Vec<Arc<Body>> {
        let mut chain = Vec::new();
        let mut cur = self.get(name).cloned();
        while let Some(body) = cur {
            // a malformed tree must not loop forever
            if chain.iter().any(|b: &Arc<Body>| b.name == body.name) {
                break;
            }
            cur = body.parent.as_deref().and_then(|p| self.get(p)).cloned();
            chain.push(body);
        }
        chain
    }

    /// The nearest body that is `a` or an ancestor of `a` and also
    /// `b` or an ancestor of `b`.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<Arc<Body>> {
        let theirs = self.chain(b);
        self.chain(a)
            .into_iter()
            .find(|x| theirs.iter().any(|y| y.name == x.name))
    }

    /// The body on `descendant`'s chain whose parent is `ancestor`.
    pub fn child_toward(&self, ancestor: &str, descendant: &str) -> Option<Arc<Body>> {
        self.chain(descendant)
            .into_iter()
            .find(|b| b.parent.as_deref() == Some(ancestor))
    }

    pub fn satellites(&self, name: &str) -> impl Iterator<Item = &Arc<Body>> {
        self.get(name)
            .into_iter()
            .flat_map(|b| b.satellites.iter())
            .filter_map(|s| self.get(s))
    }
}
