//! One candidate transfer: where it goes, the burns that get there,
//! and how far their calculation got.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use color_eyre::eyre::{self, OptionExt};
use nalgebra::Vector3;
use thiserror::Error;
use time::Duration;
use tracing::{debug, info, trace, warn};

use crate::{
    bodies::Body,
    burn::{self, Burn},
    config::Settings,
    destination::{Destination, Origin},
    host::{Host, HostLease, NodeId},
    kepler::orbits::{Orbit, StateVector},
    math::{self, Departure},
    time::UT,
    transient::TransientNodes,
};

/// Ejection burns this far in the past get recalculated.
pub const STALE_TOLERANCE: Duration = Duration::SECOND;

#[derive(Clone, Debug, PartialEq)]
pub enum TransferState {
    Uncalculated,
    /// No ejection burn exists for this transfer.
    Infeasible(Infeasibility),
    EjectionCalculated,
    PlaneChangeCalculated,
    PlaneChangeSkipped(SkipReason),
    PlaneChangeFailed(FailReason),
}

impl TransferState {
    /// Nothing more will be calculated until the next reset.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Uncalculated | Self::EjectionCalculated)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncalculated => write!(f, "uncalculated"),
            Self::Infeasible(reason) => write!(f, "infeasible: {reason}"),
            Self::EjectionCalculated => write!(f, "ejection calculated"),
            Self::PlaneChangeCalculated => write!(f, "plane change calculated"),
            Self::PlaneChangeSkipped(reason) => write!(f, "plane change skipped: {reason}"),
            Self::PlaneChangeFailed(reason) => write!(f, "plane change failed: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Infeasibility {
    #[error("no usable origin orbit")]
    NoOrigin,
    #[error("destination has no usable orbit")]
    NoDestinationOrbit,
    #[error("no common reference body")]
    NoCommonAncestor,
    #[error("destination encloses the origin")]
    EnclosingBody,
    #[error("degenerate orbit: {0}")]
    Degenerate(&'static str),
    #[error("zero gravitational parameter")]
    ZeroGravity,
    #[error("orbits never align")]
    NeverAligns,
    #[error("unknown body {0}")]
    UnknownBody(Arc<str>),
    #[error("calculation panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("disabled")]
    Disabled,
    #[error("no ejection burn")]
    NoEjectionBurn,
    #[error("already coplanar")]
    AlreadyCoplanar,
    #[error("foreign nodes present")]
    ForeignNodes,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum FailReason {
    #[error("did not converge after {iterations} iterations ({residual_degrees:.3}° left)")]
    NotConverged {
        iterations: u32,
        residual_degrees: f64,
    },
    #[error("trajectory never reaches the destination's reference body")]
    NoTransferPatch,
    #[error("trajectory never crosses the destination plane")]
    NoPlaneCrossing,
    #[error("host error: {0}")]
    Host(String),
    #[error("calculation panicked: {0}")]
    Panicked(String),
    #[error("superseded")]
    Aborted,
}

/// What was done about nodes already on the vessel before the plane
/// change stage ran.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForeignNodePolicy {
    Skipped { count: usize },
    Removed { count: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BurnKind {
    Ejection,
    PlaneChange,
}

/// The outcome of the plane change stage, carried from the background
/// worker back to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaneChangeResult {
    pub state: TransferState,
    pub burn: Option<Burn>,
    pub foreign_nodes: Option<ForeignNodePolicy>,
}

#[derive(Clone, Debug)]
pub struct TransferModel {
    pub origin: Origin,
    pub destination: Destination,
    /// Display name of the destination.
    pub name: Arc<str>,
    /// How far up the origin's reference-body chain the destination
    /// sits; zero for siblings.
    pub tier: usize,
    pub state: TransferState,
    pub ejection: Option<Burn>,
    pub plane_change: Option<Burn>,
    /// The origin circles the common body against the destination.
    pub retrograde: bool,
    pub active: bool,
    pub foreign_nodes: Option<ForeignNodePolicy>,
    /// Time and distance (m) of the closest approach to the destination,
    /// for transfers that stay around one body.
    pub closest_approach: Option<(UT, f64)>,
    pub arrival: Option<UT>,
    /// Reference body of the transfer orbit and the plane to match.
    plane: Option<(Arc<str>, Orbit)>,
    /// Node of a plane-change burn that is being recalculated.
    detached_plane_node: Option<NodeId>,
    /// Linked nodes whose burns no longer exist.
    orphans: Vec<NodeId>,
}

impl TransferModel {
    pub fn new(origin: Origin, destination: Destination, name: Arc<str>, tier: usize) -> Self {
        Self {
            origin,
            destination,
            name,
            tier,
            state: TransferState::Uncalculated,
            ejection: None,
            plane_change: None,
            retrograde: false,
            active: false,
            foreign_nodes: None,
            closest_approach: None,
            arrival: None,
            plane: None,
            detached_plane_node: None,
            orphans: Vec::new(),
        }
    }

    /// Forget every calculated result.
    pub fn reset(&mut self) {
        let linked = [self.ejection.take(), self.plane_change.take()]
            .into_iter()
            .flatten()
            .filter_map(|b| b.node);
        self.orphans.extend(linked);
        self.orphans.extend(self.detached_plane_node.take());
        self.state = TransferState::Uncalculated;
        self.foreign_nodes = None;
        self.closest_approach = None;
        self.arrival = None;
        self.plane = None;
        self.retrograde = false;
    }

    pub fn burn(&self, kind: BurnKind) -> Option<&Burn> {
        match kind {
            BurnKind::Ejection => self.ejection.as_ref(),
            BurnKind::PlaneChange => self.plane_change.as_ref(),
        }
    }

    pub fn burn_mut(&mut self, kind: BurnKind) -> Option<&mut Burn> {
        match kind {
            BurnKind::Ejection => self.ejection.as_mut(),
            BurnKind::PlaneChange => self.plane_change.as_mut(),
        }
    }

    /// The ejection burn's window passed more than a moment ago.
    pub fn is_stale(&self, now: UT) -> bool {
        self.ejection
            .as_ref()
            .is_some_and(|b| b.is_stale(now - STALE_TOLERANCE))
    }

    /// Delta-V to display: the ejection burn, plus the plane change
    /// if the settings ask for it.
    pub fn total_delta_v(&self, settings: &Settings) -> Option<f64> {
        let ejection = self.ejection.as_ref()?.magnitude();
        let plane_change = match &self.plane_change {
            Some(b) if settings.add_plane_change_delta_v => b.magnitude(),
            _ => 0.0,
        };
        Some(ejection + plane_change)
    }

    pub fn calculate_ejection_burn<H: Host + ?Sized>(&mut self, host: &H) {
        let node = self.ejection.as_ref().and_then(|b| b.node);
        if let Some(id) = self.plane_change.take().and_then(|b| b.node) {
            self.orphans.extend(self.detached_plane_node.replace(id));
        }
        self.foreign_nodes = None;
        self.closest_approach = None;
        self.arrival = None;

        match Geometry::resolve(host, &self.origin, &self.destination).and_then(|g| g.eject()) {
            Ok(ejection) => {
                debug!(
                    destination = %self.name,
                    ut = %ejection.burn.ut,
                    deltav = ejection.burn.magnitude(),
                    retrograde = ejection.retrograde,
                    "ejection burn calculated"
                );
                let mut burn = ejection.burn;
                burn.node = node;
                self.ejection = Some(burn);
                self.retrograde = ejection.retrograde;
                self.arrival = Some(ejection.arrival);
                self.closest_approach = ejection.closest_approach;
                self.plane = Some(ejection.plane);
                self.state = TransferState::EjectionCalculated;
            }
            Err(reason) => {
                warn!(destination = %self.name, %reason, "transfer is infeasible");
                self.orphans.extend(node);
                self.orphans.extend(self.detached_plane_node.take());
                self.ejection = None;
                self.plane = None;
                self.retrograde = false;
                self.state = TransferState::Infeasible(reason);
            }
        }
    }

    /// Find the corrective burn that puts the transfer orbit in the
    /// destination's plane, by iterating on transient nodes. Never
    /// leaves a transient node behind.
    pub fn calculate_plane_change_burn<L: HostLease>(&mut self, lease: &mut L, settings: &Settings) {
        let owned = self.linked_nodes();
        let relinked = self.calculate_plane_change_burn_with(lease, settings, &owned);
        self.relink(&relinked);
    }

    /// As [`TransferModel::calculate_plane_change_burn`], but nodes in
    /// `owned` belong to the caller rather than the user: they are taken
    /// off the vessel while the burn is measured and put back afterwards
    /// instead of counting as foreign. Returns `(old, new)` ids of the
    /// nodes put back.
    pub fn calculate_plane_change_burn_with<L: HostLease>(
        &mut self,
        lease: &mut L,
        settings: &Settings,
        owned: &[NodeId],
    ) -> Vec<(NodeId, NodeId)> {
        let (outcome, relinked) = self.plane_change_outcome(lease, settings, owned);
        self.plane_change = None;
        self.state = match outcome {
            PlaneChange::Computed(burn) => {
                debug!(
                    destination = %self.name,
                    ut = %burn.ut,
                    deltav = burn.magnitude(),
                    "plane change burn calculated"
                );
                self.plane_change = Some(burn);
                TransferState::PlaneChangeCalculated
            }
            PlaneChange::Skipped(reason) => {
                debug!(destination = %self.name, %reason, "plane change skipped");
                TransferState::PlaneChangeSkipped(reason)
            }
            PlaneChange::Failed(reason) => {
                warn!(destination = %self.name, %reason, "plane change failed");
                TransferState::PlaneChangeFailed(reason)
            }
        };
        relinked
    }

    fn plane_change_outcome<L: HostLease>(
        &mut self,
        lease: &mut L,
        settings: &Settings,
        owned: &[NodeId],
    ) -> (PlaneChange, Vec<(NodeId, NodeId)>) {
        if !settings.generate_plane_change_burns {
            return (PlaneChange::Skipped(SkipReason::Disabled), Vec::new());
        }
        let (Some(ejection), Some((body, plane))) = (self.ejection.clone(), self.plane.clone())
        else {
            return (PlaneChange::Skipped(SkipReason::NoEjectionBurn), Vec::new());
        };

        let foreign_nodes = &mut self.foreign_nodes;
        panic::catch_unwind(AssertUnwindSafe(|| {
            let host_failure =
                |error: eyre::Report| PlaneChange::Failed(FailReason::Host(format!("{error:#}")));
            let (own, foreign): (Vec<_>, Vec<_>) =
                lease.host().nodes().into_iter().partition(|id| owned.contains(id));
            if !foreign.is_empty() {
                let count = foreign.len();
                if !settings.delete_existing_maneuvers {
                    *foreign_nodes = Some(ForeignNodePolicy::Skipped { count });
                    return (PlaneChange::Skipped(SkipReason::ForeignNodes), Vec::new());
                }
                for id in foreign {
                    if let Err(error) = lease.host().remove_node(id) {
                        return (host_failure(error), Vec::new());
                    }
                }
                info!(count, "removed existing maneuver nodes");
                *foreign_nodes = Some(ForeignNodePolicy::Removed { count });
            }

            let mut scope = TransientNodes::new(lease);
            for id in own {
                if let Err(error) = scope.stash(id) {
                    return (host_failure(error), scope.restore());
                }
            }
            let outcome = converge_plane_change(&mut scope, settings, &ejection, &body, &plane)
                .unwrap_or_else(host_failure);
            (outcome, scope.restore())
        }))
        .unwrap_or_else(|payload| {
            let reason = FailReason::Panicked(panic_message(&*payload));
            (PlaneChange::Failed(reason), Vec::new())
        })
    }

    /// Host nodes this transfer is linked to, including ones still
    /// waiting to be removed.
    pub fn linked_nodes(&self) -> Vec<NodeId> {
        [self.ejection.as_ref(), self.plane_change.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|b| b.node)
            .chain(self.detached_plane_node)
            .chain(self.orphans.iter().copied())
            .collect()
    }

    /// Follow nodes that the host recreated under new ids.
    pub fn relink(&mut self, pairs: &[(NodeId, NodeId)]) {
        let remap = |id: &mut NodeId| {
            if let Some(&(_, new)) = pairs.iter().find(|(old, _)| old == id) {
                *id = new;
            }
        };
        for burn in [self.ejection.as_mut(), self.plane_change.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(id) = &mut burn.node {
                remap(id);
            }
        }
        if let Some(id) = &mut self.detached_plane_node {
            remap(id);
        }
        self.orphans.iter_mut().for_each(remap);
    }

    pub fn plane_change_result(&self) -> PlaneChangeResult {
        PlaneChangeResult {
            state: self.state.clone(),
            burn: self.plane_change.clone(),
            foreign_nodes: self.foreign_nodes,
        }
    }

    /// Take over a plane change calculated elsewhere, keeping the link
    /// to a node made from the previous plane change burn.
    pub fn absorb_plane_change(&mut self, result: PlaneChangeResult) {
        self.state = result.state;
        self.foreign_nodes = result.foreign_nodes;
        self.plane_change = result.burn;
        match (&mut self.plane_change, self.detached_plane_node.take()) {
            (Some(burn), node) => burn.node = node,
            (None, Some(node)) => self.orphans.push(node),
            (None, None) => {}
        }
    }

    /// Bring the host nodes linked to this transfer in line with its
    /// burns. A node is only recreated when it differs from its burn.
    pub fn update_maneuvers<H: Host + ?Sized>(&mut self, host: &mut H) -> eyre::Result<()> {
        for id in std::mem::take(&mut self.orphans) {
            if host.node(id).is_some() {
                debug!(?id, "removing node of a discarded burn");
                host.remove_node(id)?;
            }
        }
        for burn in [self.ejection.as_mut(), self.plane_change.as_mut()]
            .into_iter()
            .flatten()
        {
            let Some(id) = burn.linked_node(host) else {
                continue;
            };
            let Some(node) = host.node(id) else {
                continue;
            };
            if burn.matches(&node) {
                continue;
            }
            debug!(?id, "maneuver node is out of date, recreating");
            host.remove_node(id)?;
            burn.node = None;
            burn.node = Some(host.create_node(burn.ut, burn.deltav)?);
        }
        Ok(())
    }

    /// Replace the vessel's nodes with this transfer's burns.
    pub fn create_maneuvers<H: Host>(&mut self, host: &mut H) -> eyre::Result<()> {
        let ejection = self
            .ejection
            .clone()
            .ok_or_eyre("transfer has no ejection burn")?;
        let plane_change = self.plane_change.clone();
        for id in host.nodes() {
            host.remove_node(id)?;
        }

        let ids = {
            let mut lease = &mut *host;
            let mut scope = TransientNodes::new(&mut lease);
            scope.create(ejection.ut, ejection.deltav)?;
            if let Some(burn) = &plane_change {
                scope.create(burn.ut, burn.deltav)?;
            }
            scope.commit()
        };
        if let Some(burn) = &mut self.ejection {
            burn.node = ids.first().copied();
        }
        if let Some(burn) = &mut self.plane_change {
            burn.node = ids.get(1).copied();
        }
        self.orphans.clear();
        self.detached_plane_node = None;
        info!(destination = %self.name, nodes = ids.len(), "maneuver nodes created");
        Ok(())
    }

    /// Warp to shortly before the ejection burn.
    pub fn warp_to_ejection<H: Host + ?Sized>(&self, host: &mut H, settings: &Settings) -> eyre::Result<()> {
        let ejection = self
            .ejection
            .as_ref()
            .ok_or_eyre("transfer has no ejection burn")?;
        let target = ejection.ut - settings.warp_margin();
        if target <= host.universal_time() {
            debug!(destination = %self.name, "ejection burn is within the warp margin");
            return Ok(());
        }
        info!(destination = %self.name, ut = %target, "warping to ejection");
        host.warp_to(target)
    }
}

enum PlaneChange {
    Computed(Burn),
    Skipped(SkipReason),
    Failed(FailReason),
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

fn converge_plane_change<L: HostLease>(
    scope: &mut TransientNodes<'_, L>,
    settings: &Settings,
    ejection: &Burn,
    patch_body: &str,
    plane: &Orbit,
) -> eyre::Result<PlaneChange> {
    let eject = scope.create(ejection.ut, ejection.deltav)?;
    scope.settle();
    if scope.is_cancelled() {
        return Ok(PlaneChange::Failed(FailReason::Aborted));
    }

    let mu = scope
        .host()
        .system()
        .get(patch_body)
        .map(|b| b.mu)
        .ok_or_eyre("reference body of the transfer vanished")?;
    let Some(patch) = scope
        .trajectory(eject)?
        .into_iter()
        .find(|p| &*p.body == patch_body)
    else {
        return Ok(PlaneChange::Failed(FailReason::NoTransferPatch));
    };
    let inclination = math::relative_inclination(&patch, plane);
    debug!(inclination = inclination.to_degrees(), "transfer orbit measured");
    if inclination < settings.coplanar_tolerance() {
        return Ok(PlaneChange::Skipped(SkipReason::AlreadyCoplanar));
    }
    let Some(node_ut) = first_crossing(&patch, plane, mu) else {
        return Ok(PlaneChange::Failed(FailReason::NoPlaneCrossing));
    };

    let before = patch.state_at(node_ut, mu);
    let mut total = rotate_into_plane(&before, plane);
    let mut deltav = burn::from_inertial(&before, total);
    let node = scope.create(node_ut, deltav)?;

    let cap = settings.plane_change.max_iterations.max(1);
    let mut residual = inclination;
    for iteration in 1..=cap {
        scope.settle();
        if scope.is_cancelled() {
            return Ok(PlaneChange::Failed(FailReason::Aborted));
        }
        let trajectory = scope.trajectory(node)?;
        let Some(after) = trajectory.iter().find(|p| &*p.body == patch_body) else {
            return Ok(PlaneChange::Failed(FailReason::NoTransferPatch));
        };
        residual = math::relative_inclination(after, plane);
        trace!(iteration, residual = residual.to_degrees(), "plane change iteration");
        if residual < settings.plane_change.tolerance() {
            return Ok(PlaneChange::Computed(Burn::new(node_ut, deltav)));
        }
        if iteration == cap {
            break;
        }
        total += rotate_into_plane(&after.state_at(node_ut, mu), plane);
        deltav = burn::from_inertial(&before, total);
        scope.update(node, deltav)?;
    }
    Ok(PlaneChange::Failed(FailReason::NotConverged {
        iterations: cap,
        residual_degrees: residual.to_degrees(),
    }))
}

/// Earliest crossing of `plane` on `patch`, at or after the patch
/// begins.
fn first_crossing(patch: &Orbit, plane: &Orbit, mu: f64) -> Option<UT> {
    let (an, dn) = patch.relative_nodes(plane)?;
    [an, dn]
        .into_iter()
        .filter(|&ta| patch.is_elliptic() || libm::cos(ta) > -1.0 / patch.e)
        .map(|ta| patch.time_to_ta(ta, patch.epoch, mu))
        .filter(|t| t.is_finite() && *t >= 0.0)
        .min_by(f64::total_cmp)
        .map(|t| patch.epoch + Duration::seconds_f64(t))
}

/// Inertial delta-V that rotates the velocity about the radius vector
/// until the orbit lies in `plane`.
fn rotate_into_plane(sv: &StateVector, plane: &Orbit) -> Vector3<f64> {
    let r = sv.position.normalize();
    let h = sv.position.cross(&sv.velocity).normalize();
    let target = plane.normal();
    let angle = libm::atan2(r.dot(&h.cross(&target)), h.dot(&target));
    let v = sv.velocity;
    let (sin, cos) = (libm::sin(angle), libm::cos(angle));
    let rotated = v * cos + r.cross(&v) * sin + r * r.dot(&v) * (1.0 - cos);
    let diff = rotated - v;
    if diff.norm() < f64::EPSILON {
        return Vector3::zeros();
    }
    let horizontal = v - r * r.dot(&v);
    diff.normalize() * math::plane_change_delta_v(angle, horizontal.norm())
}

struct Ejection {
    burn: Burn,
    retrograde: bool,
    arrival: UT,
    closest_approach: Option<(UT, f64)>,
    plane: (Arc<str>, Orbit),
}

/// A transfer resolved against the body tree.
struct Geometry {
    now: UT,
    /// The craft's orbit: the vessel's own, or a parking orbit.
    parking: Orbit,
    parking_body: Arc<Body>,
    common: Arc<Body>,
    /// Origin side and destination side at the common body's level.
    from: Orbit,
    to: Orbit,
    /// Bodies to climb out of, innermost first, each with its parent's
    /// gravitational parameter. Empty for a direct transfer.
    levels: Vec<(Arc<Body>, f64)>,
}

impl Geometry {
    fn resolve<H: Host + ?Sized>(
        host: &H,
        origin: &Origin,
        destination: &Destination,
    ) -> Result<Self, Infeasibility> {
        let system = host.system();
        let now = host.universal_time();

        let parking = match origin {
            Origin::Vessel(id) => {
                if *destination == Destination::Vessel(*id) {
                    return Err(Infeasibility::Degenerate("destination is the origin"));
                }
                let vessel = host.vessel(*id).ok_or(Infeasibility::NoOrigin)?;
                if !vessel.orbit.is_elliptic() {
                    return Err(Infeasibility::Degenerate("origin orbit is open"));
                }
                vessel.orbit.clone()
            }
            Origin::Body(name) => {
                let body = system
                    .get(name)
                    .ok_or_else(|| Infeasibility::UnknownBody(name.clone()))?;
                Orbit::circular(name.clone(), body.parking_radius(), 0.0, 0.0, 0.0, now)
            }
        };
        let parking_body = system
            .get(&parking.body)
            .ok_or_else(|| Infeasibility::UnknownBody(parking.body.clone()))?
            .clone();
        if parking_body.mu <= 0.0 {
            return Err(Infeasibility::ZeroGravity);
        }
        let chain = system.chain(&parking_body.name);

        if let Destination::Body(name) = destination {
            if chain.iter().any(|b| b.name == *name) {
                return Err(Infeasibility::EnclosingBody);
            }
        }
        let target = destination.resolve(host).ok_or_else(|| match destination {
            Destination::Body(name) => Infeasibility::UnknownBody(name.clone()),
            Destination::Vessel(_) => Infeasibility::NoDestinationOrbit,
        })?;
        let target_orbit = target
            .orbit()
            .ok_or(Infeasibility::NoDestinationOrbit)?
            .clone();
        if !target_orbit.is_elliptic() {
            return Err(Infeasibility::Degenerate("destination orbit is open"));
        }

        let common = system
            .common_ancestor(&parking_body.name, &target_orbit.body)
            .ok_or(Infeasibility::NoCommonAncestor)?;
        if common.mu <= 0.0 {
            return Err(Infeasibility::ZeroGravity);
        }

        let mut levels = Vec::new();
        for body in chain.iter().take_while(|b| b.name != common.name) {
            let parent_mu = system
                .parent(&body.name)
                .map(|p| p.mu)
                .ok_or(Infeasibility::NoCommonAncestor)?;
            levels.push((body.clone(), parent_mu));
        }
        let from = match levels.last() {
            Some((body, _)) => body
                .orbit
                .clone()
                .ok_or(Infeasibility::Degenerate("body without an orbit"))?,
            None => parking.clone(),
        };
        let to = if target_orbit.body == common.name {
            target_orbit
        } else {
            system
                .child_toward(&common.name, &target_orbit.body)
                .and_then(|b| b.orbit.clone())
                .ok_or(Infeasibility::NoDestinationOrbit)?
        };

        Ok(Self {
            now,
            parking,
            parking_body,
            common,
            from,
            to,
            levels,
        })
    }

    fn eject(self) -> Result<Ejection, Infeasibility> {
        let mu = self.common.mu;
        let origin_period = math::orbital_period(self.from.sma, mu)
            .ok_or(Infeasibility::Degenerate("origin orbit is not periodic"))?;
        let destination_period = math::orbital_period(self.to.sma, mu)
            .ok_or(Infeasibility::Degenerate("destination orbit is not periodic"))?;

        let normal = self.to.normal();
        let retrograde = self.from.normal().dot(&normal) < 0.0;

        // phase of the destination ahead of the origin, in the
        // destination's sense of motion
        let a = self.from.position_at(self.now, mu);
        let b = self.to.position_at(self.now, mu);
        let current_phase = libm::atan2(normal.dot(&a.cross(&b)), a.dot(&b));
        let origin_rate = if retrograde {
            -self.from.mean_motion(mu)
        } else {
            self.from.mean_motion(mu)
        };
        let relative_rate = self.to.mean_motion(mu) - origin_rate;
        let target_phase = math::phase_angle(origin_period, destination_period);
        let wait = math::time_to_next_alignment(current_phase, target_phase, relative_rate)
            .ok_or(Infeasibility::NeverAligns)?;
        trace!(
            current_phase = current_phase.to_degrees(),
            target_phase = target_phase.to_degrees(),
            wait,
            "phase alignment"
        );
        let departure = self.now + Duration::seconds_f64(wait);
        let arrival = departure
            + Duration::seconds_f64(math::hohmann_flight_time(origin_period, destination_period));

        let (burn, closest_approach) = if self.levels.is_empty() {
            let burn = Burn::new(
                departure,
                math::transfer_delta_v(&self.from, &self.to, mu, retrograde),
            );
            let mut sv = self.from.state_at(departure, mu);
            sv.velocity += burn::to_inertial(&sv, burn.deltav);
            let transfer = sv.into_orbit(1e-8);
            let closest = transfer.is_elliptic().then(|| {
                let until = arrival + (arrival - departure) / 2;
                math::closest_approach(&transfer, &self.to, mu, departure, until)
            });
            (burn, closest)
        } else {
            (self.escape_burn(wait)?, None)
        };

        Ok(Ejection {
            burn,
            retrograde,
            arrival,
            closest_approach,
            plane: (self.common.name.clone(), self.to),
        })
    }

    /// Ejection from the bottom of the SOI chain. The excess speed of
    /// the top-level transfer is carried down one level at a time.
    fn escape_burn(&self, wait: f64) -> Result<Burn, Infeasibility> {
        let mu = self.common.mu;
        let mut excess = math::excess_speed(self.from.sma, self.to.sma, mu);
        let mut outward = excess >= 0.0;
        excess = excess.abs();
        for pair in self.levels.windows(2).rev() {
            let (inner, outer_mu) = (&pair[0].0, pair[1].0.mu);
            let r = inner
                .orbit
                .as_ref()
                .ok_or(Infeasibility::Degenerate("body without an orbit"))?
                .sma;
            let periapsis_speed = math::escape_periapsis_speed(r, excess, outer_mu);
            let body_speed = libm::sqrt(outer_mu / r);
            outward = periapsis_speed >= body_speed;
            excess = (periapsis_speed - body_speed).abs();
        }

        let (bottom, bottom_parent_mu) = &self.levels[0];
        let departure = self.now + Duration::seconds_f64(wait);
        let body_velocity = bottom
            .orbit
            .as_ref()
            .ok_or(Infeasibility::Degenerate("body without an orbit"))?
            .velocity_at(departure, *bottom_parent_mu);
        let escape = if outward { body_velocity } else { -body_velocity };

        let mu_b = self.parking_body.mu;
        let h = self.parking.normal();
        let escape = escape - h * h.dot(&escape);
        if escape.norm() < f64::EPSILON {
            return Err(Infeasibility::Degenerate(
                "escape direction is normal to the origin orbit",
            ));
        }
        let escape = escape.normalize();

        let theta = math::ejection_angle(
            self.parking.sma,
            Departure::Escape {
                excess_speed: excess,
            },
            mu_b,
        );
        let burn_point = escape * libm::cos(theta) - h.cross(&escape) * libm::sin(theta);
        let ta = self.parking.ta_of_direction(&burn_point);
        let period = self
            .parking
            .period(mu_b)
            .ok_or(Infeasibility::Degenerate("origin orbit is not periodic"))?;
        let first = self.parking.time_to_ta(ta, self.now, mu_b);
        let passes = ((wait - first) / period).round().max(0.0);
        let ut = self.now + Duration::seconds_f64(first + passes * period);

        let radius = self.parking.radius_at_ta(ta);
        let (_, velocity) = self.parking.sv_at_ta(ta, mu_b);
        let deltav = math::escape_periapsis_speed(radius, excess, mu_b) - velocity.norm();
        Ok(Burn::new(ut, Vector3::new(deltav, 0.0, 0.0)))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::tests::toy_system,
        sim::SimHost,
        vessel::{Situation, Vessel, VesselId, VesselKind},
    };

    const MU_HOME: f64 = 3.5316e12;

    fn vessel(name: &str, body: &str, orbit: Orbit) -> Vessel {
        Vessel {
            name: name.into(),
            kind: VesselKind::Ship,
            situation: Situation::Orbiting,
            orbit: Orbit {
                body: body.into(),
                ..orbit
            },
        }
    }

    fn circ(r: f64, i: f64, ta: f64) -> Orbit {
        Orbit::circular(Arc::from("Home"), r, i, 0.0, ta, UT::default())
    }

    /// Active vessel in a 700 km orbit around Home plus a station at
    /// 2 Mm, inclined by `i`.
    fn scenario(i: f64) -> (SimHost, VesselId, VesselId) {
        let mut host = SimHost::new(toy_system(), UT::default());
        let ship = host.add_vessel(vessel("Ship", "Home", circ(7.0e5, 0.0, 0.0)));
        let station = host.add_vessel(vessel("Station", "Home", circ(2.0e6, i, 1.0)));
        host.set_active(Some(ship));
        (host, ship, station)
    }

    fn transfer(origin: Origin, destination: Destination) -> TransferModel {
        TransferModel::new(origin, destination, "test".into(), 0)
    }

    #[test]
    fn coplanar_transfer_needs_no_plane_change() {
        let (mut host, ship, station) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        assert_eq!(t.state, TransferState::EjectionCalculated);

        let ejection = t.ejection.clone().unwrap();
        let expected =
            libm::sqrt(MU_HOME / 7.0e5) * (libm::sqrt(2.0 * 2.0e6 / (7.0e5 + 2.0e6)) - 1.0);
        assert_relative_eq!(ejection.deltav.x, expected, max_relative = 1e-9);
        assert!(ejection.deltav.x > 0.0);
        assert!(ejection.ut >= host.universal_time());
        assert!(!t.retrograde);

        let settings = Settings::default();
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(
            t.state,
            TransferState::PlaneChangeSkipped(SkipReason::AlreadyCoplanar)
        );
        assert_eq!(t.state.to_string(), "plane change skipped: already coplanar");
        assert!(t.plane_change.is_none());
        assert!(host.nodes().is_empty());
    }

    #[test]
    fn ejection_waits_for_the_phase_angle() {
        let (host, ship, station) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        let ut = t.ejection.as_ref().unwrap().ut;

        let ship_orbit = &host.vessel(ship).unwrap().orbit;
        let station_orbit = &host.vessel(station).unwrap().orbit;
        let a = ship_orbit.position_at(ut, MU_HOME);
        let b = station_orbit.position_at(ut, MU_HOME);
        let phase = math::normalize_angle(libm::atan2(a.cross(&b).z, a.dot(&b)));
        let expected = math::phase_angle(
            math::orbital_period(7.0e5, MU_HOME).unwrap(),
            math::orbital_period(2.0e6, MU_HOME).unwrap(),
        );
        assert_relative_eq!(phase, expected, epsilon = 1e-6);
    }

    #[test]
    fn inclined_transfer_converges() {
        let (mut host, ship, station) = scenario(0.2);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        let mut settings = Settings::default();
        settings.plane_change.settle_millis = 0;
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(t.state, TransferState::PlaneChangeCalculated);
        let burn = t.plane_change.clone().unwrap();
        assert!(burn.ut > t.ejection.as_ref().unwrap().ut);
        assert!(burn.magnitude() > 0.0);
        assert!(host.nodes().is_empty());

        // the real nodes reproduce the plane the calculation found
        t.create_maneuvers(&mut host).unwrap();
        let nodes = host.nodes();
        assert_eq!(nodes.len(), 2);
        let after = host.node_trajectory(nodes[1]).unwrap();
        let plane = &host.vessel(station).unwrap().orbit;
        assert!(math::relative_inclination(&after[0], plane) < settings.plane_change.tolerance());
    }

    #[test]
    fn foreign_nodes_are_respected() {
        let (mut host, ship, station) = scenario(0.2);
        let foreign = host.create_node(UT::new_seconds(50.0), Vector3::x()).unwrap();
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);

        let settings = Settings::default();
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(
            t.state,
            TransferState::PlaneChangeSkipped(SkipReason::ForeignNodes)
        );
        assert_eq!(t.foreign_nodes, Some(ForeignNodePolicy::Skipped { count: 1 }));
        assert_eq!(host.nodes(), vec![foreign]);
        assert!(t.ejection.is_some());

        let settings = Settings {
            delete_existing_maneuvers: true,
            ..Settings::default()
        };
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(t.foreign_nodes, Some(ForeignNodePolicy::Removed { count: 1 }));
        assert_eq!(t.state, TransferState::PlaneChangeCalculated);
        assert!(host.nodes().is_empty());
    }

    #[test]
    fn linked_nodes_are_not_foreign() {
        let (mut host, ship, station) = scenario(0.2);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        t.create_maneuvers(&mut host).unwrap();
        let mut settings = Settings::default();
        settings.plane_change.settle_millis = 0;

        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(t.state, TransferState::PlaneChangeCalculated);
        assert_eq!(t.foreign_nodes, None);
        let nodes = host.nodes();
        assert_eq!(nodes.len(), 1);
        let ejection = t.ejection.clone().unwrap();
        assert_eq!(ejection.node, Some(nodes[0]));
        assert!(ejection.matches(&host.node(nodes[0]).unwrap()));

        // a user node next to the linked one is still respected
        let foreign = host.create_node(UT::new_seconds(50.0), Vector3::x()).unwrap();
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(t.state, TransferState::PlaneChangeSkipped(SkipReason::ForeignNodes));
        assert_eq!(t.foreign_nodes, Some(ForeignNodePolicy::Skipped { count: 1 }));
        let after = host.nodes();
        assert_eq!(after.len(), 2);
        assert!(after.contains(&foreign) && after.contains(&nodes[0]));
    }

    #[test]
    fn iteration_cap_reports_failure() {
        let (mut host, ship, station) = scenario(0.2);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        let mut settings = Settings::default();
        settings.plane_change.settle_millis = 0;
        settings.plane_change.max_iterations = 1;
        settings.plane_change.tolerance_degrees = 0.0;
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert!(matches!(
            t.state,
            TransferState::PlaneChangeFailed(FailReason::NotConverged { iterations: 1, .. })
        ));
        assert!(t.plane_change.is_none());
        assert!(host.nodes().is_empty());
    }

    #[test]
    fn disabled_plane_change_is_skipped() {
        let (mut host, ship, station) = scenario(0.2);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        let settings = Settings {
            generate_plane_change_burns: false,
            ..Settings::default()
        };
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(t.state, TransferState::PlaneChangeSkipped(SkipReason::Disabled));

        let settings = Settings::default();
        t.calculate_plane_change_burn(&mut &mut host, &settings);
        assert_eq!(
            t.state,
            TransferState::PlaneChangeSkipped(SkipReason::NoEjectionBurn)
        );
    }

    #[test]
    fn disjoint_trees_are_infeasible() {
        let (mut host, ship, _) = scenario(0.0);
        let rogue = Body {
            name: "Rogue".into(),
            mu: 1.0e12,
            radius: 1.0e5,
            atmosphere_depth: 0.0,
            soi: f64::INFINITY,
            orbit: None,
            parent: None,
            satellites: Vec::new(),
            is_star: true,
        };
        host.system.bodies.insert(rogue.name.clone(), Arc::new(rogue));
        let drifter = host.add_vessel(vessel("Drifter", "Rogue", circ(5.0e5, 0.0, 0.0)));

        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(drifter));
        t.calculate_ejection_burn(&host);
        assert_eq!(
            t.state,
            TransferState::Infeasible(Infeasibility::NoCommonAncestor)
        );
        assert!(t.ejection.is_none());
    }

    #[test]
    fn enclosing_bodies_and_co_orbiting_targets() {
        let (mut host, ship, _) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Body("Home".into()));
        t.calculate_ejection_burn(&host);
        assert_eq!(t.state, TransferState::Infeasible(Infeasibility::EnclosingBody));

        let twin = host.add_vessel(vessel("Twin", "Home", circ(7.0e5, 0.0, 2.0)));
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(twin));
        t.calculate_ejection_burn(&host);
        assert_eq!(t.state, TransferState::Infeasible(Infeasibility::NeverAligns));
    }

    #[test]
    fn interplanetary_ejection_escapes_forward() {
        let (host, ship, _) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Body("Outer".into()));
        t.calculate_ejection_burn(&host);
        assert_eq!(t.state, TransferState::EjectionCalculated);
        let burn = t.ejection.clone().unwrap();
        let escape = libm::sqrt(2.0 * MU_HOME / 7.0e5) - libm::sqrt(MU_HOME / 7.0e5);
        assert!(burn.deltav.x > escape);
        assert_eq!(burn.deltav.y, 0.0);

        // heading inward needs the same escape, just in the other direction
        let mut inner = transfer(Origin::Vessel(ship), Destination::Body("Inner".into()));
        inner.calculate_ejection_burn(&host);
        assert_eq!(inner.state, TransferState::EjectionCalculated);
        assert!(inner.ejection.unwrap().deltav.x > escape);
    }

    #[test]
    fn grounded_origin_uses_a_parking_orbit() {
        let (host, _, _) = scenario(0.0);
        let mut t = transfer(Origin::Body("Home".into()), Destination::Body("Moon".into()));
        t.calculate_ejection_burn(&host);
        let r1 = host.system().get("Home").unwrap().parking_radius();
        let dv = math::transfer_delta_v(
            &circ(r1, 0.0, 0.0),
            &circ(1.2e7, 0.0, 0.0),
            MU_HOME,
            false,
        );
        assert_relative_eq!(t.ejection.unwrap().deltav, dv, max_relative = 1e-9);
        assert!(t.closest_approach.is_some());
    }

    #[test]
    fn totals_and_staleness() {
        let mut t = transfer(Origin::Body("Home".into()), Destination::Body("Moon".into()));
        t.ejection = Some(Burn::new(UT::new_seconds(100.0), Vector3::new(3.0, 4.0, 0.0)));
        t.plane_change = Some(Burn::new(UT::new_seconds(900.0), Vector3::new(0.0, 2.0, 0.0)));
        assert_eq!(t.total_delta_v(&Settings::default()), Some(5.0));
        let settings = Settings {
            add_plane_change_delta_v: true,
            ..Settings::default()
        };
        assert_eq!(t.total_delta_v(&settings), Some(7.0));

        assert!(!t.is_stale(UT::new_seconds(100.5)));
        assert!(t.is_stale(UT::new_seconds(102.0)));
    }

    #[test]
    fn changed_burns_recreate_their_nodes() {
        let (mut host, ship, station) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        t.create_maneuvers(&mut host).unwrap();
        let first = host.nodes();
        assert_eq!(first.len(), 1);

        t.update_maneuvers(&mut host).unwrap();
        assert_eq!(host.nodes(), first);

        t.ejection.as_mut().unwrap().deltav.x += 5.0;
        t.update_maneuvers(&mut host).unwrap();
        let second = host.nodes();
        assert_eq!(second.len(), 1);
        assert_ne!(second, first);
        assert_eq!(t.ejection.as_ref().unwrap().node, Some(second[0]));

        t.reset();
        t.update_maneuvers(&mut host).unwrap();
        assert!(host.nodes().is_empty());
    }

    #[test]
    fn warp_stops_short_of_the_burn() {
        let (mut host, ship, station) = scenario(0.0);
        let mut t = transfer(Origin::Vessel(ship), Destination::Vessel(station));
        t.calculate_ejection_burn(&host);
        let settings = Settings::default();
        t.warp_to_ejection(&mut host, &settings).unwrap();
        let ut = t.ejection.as_ref().unwrap().ut;
        assert_eq!(host.universal_time(), ut - settings.warp_margin());
        // already inside the margin
        t.warp_to_ejection(&mut host, &settings).unwrap();
        assert_eq!(host.universal_time(), ut - settings.warp_margin());
    }
}
