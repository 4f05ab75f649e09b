//! Which destinations can be reached from an origin.

use std::{collections::HashSet, sync::Arc};

use itertools::Itertools;
use ordered_float::OrderedFloat;
use tracing::debug;

use crate::{
    destination::{Destination, Origin, Orbiting},
    host::Host,
    vessel::{Situation, VesselKind},
};

/// A destination found by [`resolve`].
#[derive(Clone, Debug, PartialEq)]
pub struct Reachable {
    pub destination: Destination,
    pub name: Arc<str>,
    /// Index into the origin's reference-body chain of the body the
    /// destination is reached around; zero is the origin's own body.
    pub tier: usize,
    /// Orbital distance from that body (m).
    pub distance: f64,
}

/// Enumerate the destinations reachable from `origin`: the satellites
/// of every body on its reference-body chain (the chain itself
/// excluded), vessels and asteroids orbiting one of those bodies or a
/// chain body, and the current target. Ordered nearest tier first, then
/// by distance.
pub fn resolve<H: Host + ?Sized>(host: &H, origin: &Origin) -> Vec<Reachable> {
    let system = host.system();
    let Some(reference) = origin.reference_body(host) else {
        return Vec::new();
    };
    let chain = system.chain(&reference);
    let on_chain: HashSet<&str> = chain.iter().map(|b| &*b.name).collect();

    let mut reachable = Vec::new();
    for (tier, center) in chain.iter().enumerate() {
        for body in system.satellites(&center.name) {
            if on_chain.contains(&*body.name) {
                continue;
            }
            let distance = body.orbit.as_ref().map_or(0.0, |o| o.sma);
            reachable.push(Reachable {
                destination: Destination::Body(body.name.clone()),
                name: body.name.clone(),
                tier,
                distance,
            });
        }
    }

    // vessels count at the tier of the body they orbit, or of the
    // reachable body whose SOI they are in
    let body_tier = |name: &str| -> Option<(usize, f64)> {
        if let Some(tier) = chain.iter().position(|b| &*b.name == name) {
            return Some((tier, 0.0));
        }
        reachable
            .iter()
            .find(|r| matches!(&r.destination, Destination::Body(b) if &**b == name))
            .map(|r| (r.tier, r.distance))
    };
    let mut vessels = Vec::new();
    for id in host.vessels() {
        if *origin == Origin::Vessel(id) {
            continue;
        }
        let Some(vessel) = host.vessel(id) else {
            continue;
        };
        if vessel.kind == VesselKind::Debris
            || vessel.situation != Situation::Orbiting
            || !vessel.orbit.is_elliptic()
        {
            continue;
        }
        let Some((tier, offset)) = body_tier(vessel.body()) else {
            continue;
        };
        let distance = if offset > 0.0 { offset } else { vessel.orbit.sma };
        vessels.push(Reachable {
            destination: Destination::Vessel(id),
            name: vessel.name.clone(),
            tier,
            distance,
        });
    }
    reachable.extend(vessels);

    if let Some(target) = host.target() {
        if !reachable.iter().any(|r| r.destination == target) {
            if let Some(found) = target.resolve(host) {
                debug!(target = %found.name(), "adding target outside the usual destinations");
                reachable.push(Reachable {
                    name: found.name().clone(),
                    distance: found.orbit().map_or(0.0, |o| o.sma),
                    destination: target,
                    tier: chain.len(),
                });
            }
        }
    }

    reachable
        .into_iter()
        .sorted_by_key(|r| (r.tier, OrderedFloat(r.distance), r.name.clone()))
        .collect()
}
