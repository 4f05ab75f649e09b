//! Detecting the host changes that invalidate the transfer model.

use std::sync::Arc;

use tracing::debug;

use crate::{
    destination::{Destination, Origin},
    host::Host,
    kepler::orbits::Orbit,
    vessel::{Situation, VesselId},
};

/// Relative tolerance when comparing orbit snapshots.
pub const ORBIT_TOL: f64 = 1e-6;

/// What changed since the last poll, most significant first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    /// A different vessel, or the same vessel in a new SOI.
    Origin,
    Situation,
    Target,
    /// The active vessel's orbit was altered.
    Orbit,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Snapshot {
    vessel: Option<VesselId>,
    body: Option<Arc<str>>,
    situation: Option<Situation>,
    target: Option<Destination>,
    orbit: Option<Orbit>,
}

impl Snapshot {
    fn take<H: Host + ?Sized>(host: &H) -> Self {
        let vessel = host.active_vessel();
        let state = vessel.and_then(|id| host.vessel(id));
        Self {
            vessel,
            body: state.map(|v| v.body().clone()),
            situation: state.map(|v| v.situation),
            target: host.target(),
            orbit: state.map(|v| v.orbit.clone()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Watcher {
    last: Option<Snapshot>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the host against the previous poll. The first poll
    /// always reports [`Change::Origin`].
    pub fn poll<H: Host + ?Sized>(&mut self, host: &H) -> Option<Change> {
        let now = Snapshot::take(host);
        let change = match &self.last {
            None => Some(Change::Origin),
            Some(last) if last.vessel != now.vessel || last.body != now.body => Some(Change::Origin),
            Some(last) if last.situation != now.situation => Some(Change::Situation),
            Some(last) if last.target != now.target => Some(Change::Target),
            Some(last) => {
                let mu = now
                    .body
                    .as_deref()
                    .and_then(|b| host.system().get(b))
                    .map_or(0.0, |b| b.mu);
                match (&last.orbit, &now.orbit) {
                    (Some(a), Some(b)) if !a.approx_eq(b, mu, ORBIT_TOL) => Some(Change::Orbit),
                    _ => None,
                }
            }
        };
        if let Some(change) = change {
            debug!(?change, "host state changed");
        }
        self.last = Some(now);
        change
    }

    /// The origin the current host state implies.
    pub fn origin<H: Host + ?Sized>(host: &H) -> Option<Origin> {
        Origin::of_active_vessel(host)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;
    use crate::{
        bodies::tests::toy_system,
        sim::SimHost,
        time::UT,
        vessel::{Vessel, VesselKind},
    };

    fn host() -> (SimHost, VesselId) {
        let mut host = SimHost::new(toy_system(), UT::default());
        let ship = host.add_vessel(Vessel {
            name: "Ship".into(),
            kind: VesselKind::Ship,
            situation: Situation::Orbiting,
            orbit: Orbit::circular(Arc::from("Home"), 7.0e5, 0.0, 0.0, 0.0, UT::default()),
        });
        host.set_active(Some(ship));
        (host, ship)
    }

    #[test]
    fn reports_each_kind_of_change() {
        let (mut host, ship) = host();
        let mut watcher = Watcher::new();
        assert_eq!(watcher.poll(&host), Some(Change::Origin));
        assert_eq!(watcher.poll(&host), None);

        // time passing is not a change
        host.advance(time::Duration::seconds(300));
        assert_eq!(watcher.poll(&host), None);

        host.set_target(Some(Destination::Body("Moon".into())));
        assert_eq!(watcher.poll(&host), Some(Change::Target));

        let orbit = host.vessel(ship).unwrap().orbit.clone();
        let mut sv = orbit.state_at(host.now, 3.5316e12);
        sv.velocity += Vector3::new(0.0, 0.0, 10.0);
        host.vessel_mut(ship).unwrap().orbit = sv.into_orbit(1e-8);
        assert_eq!(watcher.poll(&host), Some(Change::Orbit));

        host.vessel_mut(ship).unwrap().situation = Situation::Landed;
        assert_eq!(watcher.poll(&host), Some(Change::Situation));

        host.vessel_mut(ship).unwrap().orbit.body = "Moon".into();
        assert_eq!(watcher.poll(&host), Some(Change::Origin));
        assert_eq!(Watcher::origin(&host), Some(Origin::Body("Moon".into())));
    }

    #[test]
    fn equal_snapshots_at_new_epochs_are_unchanged() {
        let (mut host, ship) = host();
        let mut watcher = Watcher::new();
        watcher.poll(&host);
        let orbit = host.vessel(ship).unwrap().orbit.clone();
        let later = UT::new_seconds(1234.0);
        host.vessel_mut(ship).unwrap().orbit = orbit.state_at(later, 3.5316e12).into_orbit(1e-8);
        assert_eq!(watcher.poll(&host), None);
    }
}
