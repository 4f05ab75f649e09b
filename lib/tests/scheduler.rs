use std::{cell::RefCell, rc::Rc, sync::Arc, thread, time::Duration as StdDuration};

use astrogator::{
    bodies::{Body, SolarSystem},
    config::Settings,
    destination::{Destination, Origin},
    host::{Host, ManeuverNode, Modifiers, NodeId},
    kepler::orbits::Orbit,
    loader::{LoadEvent, Loader},
    sim::SimHost,
    time::UT,
    transfer::{FailReason, SkipReason, TransferState},
    vessel::{Situation, Vessel, VesselId, VesselKind},
};
use color_eyre::eyre::{self, bail};
use nalgebra::Vector3;
use parking_lot::Mutex;

fn body(name: &str, parent: Option<&str>, mu: f64, radius: f64, sma: f64, i: f64) -> Body {
    Body {
        name: name.into(),
        mu,
        radius,
        atmosphere_depth: 0.0,
        soi: if parent.is_some() { sma / 10.0 } else { f64::INFINITY },
        orbit: parent.map(|p| Orbit::circular(p.into(), sma, i, 0.0, 0.0, UT::default())),
        parent: parent.map(Into::into),
        satellites: Vec::new(),
        is_star: parent.is_none(),
    }
}

fn system(moon_inclination: f64) -> SolarSystem {
    SolarSystem::from_bodies([
        body("Sun", None, 1.1723328e18, 2.616e8, 0.0, 0.0),
        body("Home", Some("Sun"), 3.5316e12, 6.0e5, 1.36e10, 0.0),
        body("Moon", Some("Home"), 6.5138398e10, 2.0e5, 1.2e7, moon_inclination),
        body("Far", Some("Home"), 1.7658e9, 6.0e4, 4.7e7, 0.0),
        body("Outer", Some("Sun"), 3.0136321e11, 3.2e5, 2.07e10, 0.0),
    ])
}

fn sim(moon_inclination: f64) -> SimHost {
    let mut host = SimHost::new(system(moon_inclination), UT::default());
    let ship = host.add_vessel(Vessel {
        name: "Ship".into(),
        kind: VesselKind::Ship,
        situation: Situation::Orbiting,
        orbit: Orbit::circular("Home".into(), 7.0e5, 0.0, 0.0, 0.0, UT::default()),
    });
    host.set_active(Some(ship));
    host
}

fn settings(settle_millis: u64) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.plane_change.settle_millis = settle_millis;
    Arc::new(settings)
}

fn record<H: Host + Send + 'static>(loader: &mut Loader<H>) -> Rc<RefCell<Vec<LoadEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    loader.subscribe(move |_, event| sink.borrow_mut().push(*event));
    events
}

fn run_until_idle<H: Host + Send + 'static>(loader: &mut Loader<H>) {
    for _ in 0..4000 {
        loader.tick();
        if loader.is_idle() {
            loader.tick();
            return;
        }
        thread::sleep(StdDuration::from_millis(5));
    }
    panic!("loader never went idle");
}

/// The system's three destinations plus two inclined stations around
/// Home.
fn crowded_sim() -> SimHost {
    let mut host = sim(0.1);
    for (name, r, i) in [("Station", 2.0e6, 0.2), ("Depot", 3.5e6, 0.3)] {
        host.add_vessel(Vessel {
            name: name.into(),
            kind: VesselKind::Station,
            situation: Situation::Orbiting,
            orbit: Orbit::circular("Home".into(), r, i, 0.0, 1.0, UT::default()),
        });
    }
    host
}

fn updates(events: &[LoadEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LoadEvent::TransferUpdated(_)))
        .count()
}

#[test]
fn restart_supersedes_work_in_flight() {
    let host = Arc::new(Mutex::new(crowded_sim()));
    let mut loader = Loader::new(host.clone(), settings(50)).unwrap();
    let events = record(&mut loader);
    loader.notify_display_opened();
    loader.tick();
    assert_eq!(loader.model().generation, 1);
    assert_eq!(loader.model().len(), 5);

    // wait for the worker to be partway through the first run
    let mut in_flight = false;
    for _ in 0..4000 {
        loader.tick();
        if updates(&events.borrow()) >= 2 {
            break;
        }
        if !host.lock().nodes().is_empty() {
            in_flight = true;
            break;
        }
        thread::sleep(StdDuration::from_millis(1));
    }
    assert!(in_flight);
    assert!(!loader.is_idle());

    let origin = Origin::of_active_vessel(&*host.lock());
    loader.start(origin);
    let restarted_at = events.borrow().len();
    assert_eq!(loader.model().generation, 2);
    assert_eq!(loader.model().len(), 5);
    assert!(loader
        .model()
        .transfers
        .iter()
        .all(|t| t.state == TransferState::EjectionCalculated));
    run_until_idle(&mut loader);

    let model = loader.model();
    assert_eq!(model.generation, 2);
    assert_eq!(model.len(), 5);
    for transfer in &model.transfers {
        assert!(transfer.state.is_settled(), "{}: {}", transfer.name, transfer.state);
        assert_ne!(
            transfer.state,
            TransferState::PlaneChangeFailed(FailReason::Aborted)
        );
    }
    assert!(host.lock().nodes().is_empty());
    let events = events.borrow();
    assert_eq!(updates(&events[restarted_at..]), 5);
    let finished = events.iter().filter(|e| **e == LoadEvent::Finished).count();
    assert_eq!(finished, 1);
}

#[test]
fn foreign_nodes_are_never_deleted() {
    let mut sim = sim(0.1);
    let foreign = sim
        .create_node(UT::new_seconds(120.0), Vector3::new(10.0, 0.0, 0.0))
        .unwrap();
    let host = Arc::new(Mutex::new(sim));
    let mut loader = Loader::new(host.clone(), settings(0)).unwrap();
    loader.notify_display_opened();
    run_until_idle(&mut loader);

    for transfer in &loader.model().transfers {
        if transfer.ejection.is_some() {
            assert_eq!(
                transfer.state,
                TransferState::PlaneChangeSkipped(SkipReason::ForeignNodes)
            );
        }
    }
    assert_eq!(host.lock().nodes(), vec![foreign]);
}

#[test]
fn coplanar_moon_needs_no_plane_change() {
    let host = Arc::new(Mutex::new(sim(0.0)));
    let settings = settings(0);
    let mut loader = Loader::new(host, settings.clone()).unwrap();
    loader.notify_display_opened();
    run_until_idle(&mut loader);

    let moon = loader.model().get(&Destination::Body("Moon".into())).unwrap();
    assert_eq!(
        moon.state,
        TransferState::PlaneChangeSkipped(SkipReason::AlreadyCoplanar)
    );
    let ejection = moon.ejection.as_ref().unwrap();
    assert_eq!(moon.total_delta_v(&settings), Some(ejection.magnitude()));
}

/// Delegates to a [`SimHost`] but cannot predict trajectories.
struct BlindHost(SimHost);

impl Host for BlindHost {
    fn universal_time(&self) -> UT {
        self.0.universal_time()
    }

    fn system(&self) -> &SolarSystem {
        self.0.system()
    }

    fn vessel(&self, id: VesselId) -> Option<&Vessel> {
        self.0.vessel(id)
    }

    fn vessels(&self) -> Vec<VesselId> {
        self.0.vessels()
    }

    fn active_vessel(&self) -> Option<VesselId> {
        self.0.active_vessel()
    }

    fn target(&self) -> Option<Destination> {
        self.0.target()
    }

    fn modifiers(&self) -> Modifiers {
        self.0.modifiers()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.0.nodes()
    }

    fn node(&self, id: NodeId) -> Option<ManeuverNode> {
        self.0.node(id)
    }

    fn create_node(&mut self, ut: UT, deltav: Vector3<f64>) -> eyre::Result<NodeId> {
        self.0.create_node(ut, deltav)
    }

    fn update_node(&mut self, id: NodeId, deltav: Vector3<f64>) -> eyre::Result<()> {
        self.0.update_node(id, deltav)
    }

    fn remove_node(&mut self, id: NodeId) -> eyre::Result<()> {
        self.0.remove_node(id)
    }

    fn node_trajectory(&self, _id: NodeId) -> eyre::Result<Vec<Orbit>> {
        bail!("trajectory solver unavailable")
    }

    fn warp_to(&mut self, ut: UT) -> eyre::Result<()> {
        self.0.warp_to(ut)
    }
}

#[test]
fn host_failures_leave_no_nodes_behind() {
    let host = Arc::new(Mutex::new(BlindHost(sim(0.1))));
    let mut loader = Loader::new(host.clone(), settings(0)).unwrap();
    loader.notify_display_opened();
    run_until_idle(&mut loader);

    let mut failed = 0;
    for transfer in &loader.model().transfers {
        if transfer.ejection.is_some() {
            assert!(matches!(
                transfer.state,
                TransferState::PlaneChangeFailed(FailReason::Host(_))
            ));
            assert!(transfer.plane_change.is_none());
            failed += 1;
        }
    }
    assert!(failed > 0);
    assert!(host.lock().nodes().is_empty());
}
