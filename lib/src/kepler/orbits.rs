//! Keplerian orbits.

use std::{f64::consts, sync::Arc};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::time::UT;

/// Recommended tolerance for the Kepler equation solvers.
pub const KEPLER_TOL: f64 = 1e-12;
/// Recommended iteration cap for the Kepler equation solvers.
pub const KEPLER_MAXITER: u64 = 64;

/// A Keplerian orbit snapshot, as captured from the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    /// Semi-major axis (m). Negative for hyperbolic orbits.
    pub sma: f64,
    /// Eccentricity (dimensionless).
    pub e: f64,
    /// Inclination (radians).
    pub i: f64,
    /// Longitude of ascending node (radians).
    pub lan: f64,
    /// Argument of periapsis (radians).
    pub argpe: f64,
    /// Mean anomaly at epoch (radians).
    pub mae: f64,
    /// The epoch of `mae`.
    pub epoch: UT,
    /// Name of the reference body.
    pub body: Arc<str>,
}

impl Orbit {
    /// A circular orbit of radius `r` starting at true anomaly
    /// `ta` at `epoch`.
    pub fn circular(body: Arc<str>, r: f64, i: f64, lan: f64, ta: f64, epoch: UT) -> Self {
        Self {
            sma: r,
            e: 0.0,
            i,
            lan,
            argpe: 0.0,
            mae: ta,
            epoch,
            body,
        }
    }

    pub fn is_elliptic(&self) -> bool {
        self.e < 1.0 && self.sma > 0.0
    }

    /// Semi-latus rectum (m).
    pub fn p(&self) -> f64 {
        self.sma * (1.0 - self.e.powi(2))
    }

    pub fn periapsis_radius(&self) -> f64 {
        self.sma * (1.0 - self.e)
    }

    /// Apoapsis radius (m); infinite for open orbits.
    pub fn apoapsis_radius(&self) -> f64 {
        if self.is_elliptic() {
            self.sma * (1.0 + self.e)
        } else {
            f64::INFINITY
        }
    }

    /// Mean motion (rad/s).
    pub fn mean_motion(&self, mu: f64) -> f64 {
        libm::sqrt(mu / self.sma.abs().powi(3))
    }

    /// Orbital period (s), if the orbit is closed.
    pub fn period(&self, mu: f64) -> Option<f64> {
        if self.is_elliptic() {
            crate::math::orbital_period(self.sma, mu)
        } else {
            None
        }
    }

    pub fn mean_anomaly_at(&self, ut: UT, mu: f64) -> f64 {
        let ma = self.mae + self.mean_motion(mu) * (ut - self.epoch).as_seconds_f64();
        if self.is_elliptic() {
            ma.rem_euclid(consts::TAU)
        } else {
            ma
        }
    }

    pub fn true_anomaly_at(&self, ut: UT, mu: f64) -> f64 {
        let ma = self.mean_anomaly_at(ut, mu);
        if self.is_elliptic() {
            ea_to_ta(ma_to_ea(ma, self.e, KEPLER_TOL, KEPLER_MAXITER), self.e)
        } else {
            ha_to_ta(ma_to_ha(ma, self.e, KEPLER_TOL, KEPLER_MAXITER), self.e)
        }
    }

    /// Mean anomaly corresponding to true anomaly `ta`.
    pub fn mean_anomaly_of_ta(&self, ta: f64) -> f64 {
        if self.is_elliptic() {
            let ea = 2.0
                * libm::atan(libm::sqrt((1.0 - self.e) / (1.0 + self.e)) * libm::tan(ta / 2.0));
            (ea - self.e * libm::sin(ea)).rem_euclid(consts::TAU)
        } else {
            let ha = 2.0
                * libm::atanh(
                    libm::sqrt((self.e - 1.0) / (self.e + 1.0)) * libm::tan(ta / 2.0),
                );
            self.e * libm::sinh(ha) - ha
        }
    }

    /// Seconds from `from` until the orbiter next reaches true
    /// anomaly `ta`. Negative for open orbits whose anomaly was
    /// already passed.
    pub fn time_to_ta(&self, ta: f64, from: UT, mu: f64) -> f64 {
        let delta = self.mean_anomaly_of_ta(ta) - self.mean_anomaly_at(from, mu);
        if self.is_elliptic() {
            delta.rem_euclid(consts::TAU) / self.mean_motion(mu)
        } else {
            delta / self.mean_motion(mu)
        }
    }

    pub fn radius_at_ta(&self, ta: f64) -> f64 {
        self.p() / (1.0 + self.e * libm::cos(ta))
    }

    /// Position and velocity in the perifocal frame PQW at true
    /// anomaly `ta`.
    fn sv_pqw(&self, ta: f64, mu: f64) -> (Vector3<f64>, Vector3<f64>) {
        let p = self.p();
        let r = self.radius_at_ta(ta);
        let rv = r * libm::cos(ta) * Vector3::new(1.0, 0.0, 0.0)
            + r * libm::sin(ta) * Vector3::new(0.0, 1.0, 0.0);
        let vv = libm::sqrt(mu / p)
            * (-libm::sin(ta) * Vector3::new(1.0, 0.0, 0.0)
                + (self.e + libm::cos(ta)) * Vector3::new(0.0, 1.0, 0.0));
        (rv, vv)
    }

    fn pqw_ijk_matrix(&self) -> Matrix3<f64> {
        let (sl, cl) = (libm::sin(self.lan), libm::cos(self.lan));
        let (sw, cw) = (libm::sin(self.argpe), libm::cos(self.argpe));
        let (si, ci) = (libm::sin(self.i), libm::cos(self.i));

        Matrix3::new(
            cl * cw - sl * sw * ci,
            -cl * sw - sl * cw * ci,
            sl * si,
            sl * cw + cl * sw * ci,
            -sl * sw + cl * cw * ci,
            -cl * si,
            sw * si,
            cw * si,
            ci,
        )
    }

    /// Unit vector along the orbit's angular momentum.
    pub fn normal(&self) -> Vector3<f64> {
        self.pqw_ijk_matrix().column(2).into_owned()
    }

    /// True anomaly at which the orbiter points along `direction`
    /// (projected into the orbital plane).
    pub fn ta_of_direction(&self, direction: &Vector3<f64>) -> f64 {
        let mat = self.pqw_ijk_matrix();
        libm::atan2(
            direction.dot(&mat.column(1).into_owned()),
            direction.dot(&mat.column(0).into_owned()),
        )
        .rem_euclid(consts::TAU)
    }

    /// Position and velocity in the body-centered inertial frame at
    /// true anomaly `ta`.
    pub fn sv_at_ta(&self, ta: f64, mu: f64) -> (Vector3<f64>, Vector3<f64>) {
        let (rv, vv) = self.sv_pqw(ta, mu);
        let mat = self.pqw_ijk_matrix();
        (mat * rv, mat * vv)
    }

    /// State vector at `ut`.
    pub fn state_at(&self, ut: UT, mu: f64) -> StateVector {
        let (position, velocity) = self.sv_at_ta(self.true_anomaly_at(ut, mu), mu);
        StateVector {
            body: self.body.clone(),
            mu,
            position,
            velocity,
            time: ut,
        }
    }

    pub fn position_at(&self, ut: UT, mu: f64) -> Vector3<f64> {
        self.state_at(ut, mu).position
    }

    pub fn velocity_at(&self, ut: UT, mu: f64) -> Vector3<f64> {
        self.state_at(ut, mu).velocity
    }

    /// True anomalies of this orbit's ascending and descending nodes
    /// relative to the plane of `other`.
    pub fn relative_nodes(&self, other: &Orbit) -> Option<(f64, f64)> {
        let line = other.normal().cross(&self.normal());
        if line.norm() < 1e-12 {
            return None;
        }
        let an = self.ta_of_direction(&line);
        Some((an, (an + consts::PI).rem_euclid(consts::TAU)))
    }

    /// Time at which the orbiter crosses `soi` outbound, searching
    /// from `after`.
    pub fn soi_exit_time(&self, soi: f64, after: UT, mu: f64) -> Option<UT> {
        if self.apoapsis_radius() < soi || self.e < 1e-9 {
            return None;
        }
        let cos_ta = (self.p() / soi - 1.0) / self.e;
        if !(-1.0..=1.0).contains(&cos_ta) {
            return None;
        }
        let ta = libm::acos(cos_ta);
        let dt = self.time_to_ta(ta, after, mu);
        if dt < 0.0 {
            return None;
        }
        Some(after + Duration::seconds_f64(dt))
    }

    /// Compare two snapshots by value. Snapshots taken at different
    /// epochs are equal if they put the orbiter in the same place.
    /// Angles compare modulo a full turn, and angles an orbit leaves
    /// undefined (the node of an equatorial orbit, the periapsis of a
    /// circular one) are folded into the next angle down.
    pub fn approx_eq(&self, other: &Orbit, mu: f64, tol: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0);
        let same_angle = |a: f64, b: f64| wrap_angle(a - b).abs() <= tol;
        let equatorial = self.i.abs() <= tol && other.i.abs() <= tol;
        let circular = self.e <= tol && other.e <= tol;
        let phases = |orbit: &Orbit| {
            let (mut node, mut peri) = (orbit.lan, orbit.argpe);
            let mut mean = orbit.mean_anomaly_at(other.epoch, mu);
            if equatorial {
                peri += node;
                node = 0.0;
            }
            if circular {
                mean += peri;
                peri = 0.0;
            }
            (node, peri, mean)
        };
        let (node_a, peri_a, mean_a) = phases(self);
        let (node_b, peri_b, mean_b) = phases(other);
        let mean_matches = if self.is_elliptic() && other.is_elliptic() {
            same_angle(mean_a, mean_b)
        } else {
            close(mean_a - mean_b, 0.0)
        };
        self.body == other.body
            && close(self.sma, other.sma)
            && close(self.e, other.e)
            && close(self.i, other.i)
            && same_angle(node_a, node_b)
            && same_angle(peri_a, peri_b)
            && mean_matches
    }
}

/// `angle` folded into (-π, π].
fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + consts::PI).rem_euclid(consts::TAU) - consts::PI;
    if wrapped <= -consts::PI {
        wrapped + consts::TAU
    } else {
        wrapped
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateVector {
    pub body: Arc<str>,
    /// Gravitational parameter of `body` (`m^3/s^2`).
    pub mu: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub time: UT,
}

impl StateVector {
    /// Convert this state vector into an [`Orbit`] with its epoch at
    /// the state vector's time.
    ///
    /// Recommended tolerance (`tol`): `1e-8`.
    pub fn into_orbit(self, tol: f64) -> Orbit {
        let rv = self.position;
        let r = rv.norm();
        let vv = self.velocity;
        let v = vv.norm();
        let hv = rv.cross(&vv);
        let h = hv.norm();
        let hhat = hv / h;
        let ev = ((v.powi(2) - self.mu / r) * rv - rv.dot(&vv) * vv) / self.mu;
        let e = ev.norm();
        let i = libm::acos((hv[2] / h).clamp(-1.0, 1.0));
        let sma = 1.0 / (2.0 / r - v.powi(2) / self.mu);

        let nv = Vector3::new(0.0, 0.0, 1.0).cross(&hv);
        let (nhat, lan) = if nv.norm() / h < tol {
            // Equatorial
            (Vector3::new(1.0, 0.0, 0.0), 0.0)
        } else {
            let nhat = nv.normalize();
            (nhat, libm::atan2(nhat[1], nhat[0]).rem_euclid(consts::TAU))
        };
        let mhat = hhat.cross(&nhat);
        let angle_in_plane = |x: &Vector3<f64>| libm::atan2(x.dot(&mhat), x.dot(&nhat));

        // Argument of latitude
        let u = angle_in_plane(&rv);
        let argpe = if e < tol {
            0.0
        } else {
            angle_in_plane(&ev).rem_euclid(consts::TAU)
        };
        let ta = (u - argpe).rem_euclid(consts::TAU);

        let mut orbit = Orbit {
            sma,
            e,
            i,
            lan,
            argpe,
            mae: 0.0,
            epoch: self.time,
            body: self.body,
        };
        orbit.mae = orbit.mean_anomaly_of_ta(ta);
        orbit
    }
}

pub fn ea_to_ta(ea: f64, e: f64) -> f64 {
    let beta = e / (1.0 + libm::sqrt(1.0 - e.powi(2)));
    ea + 2.0 * libm::atan2(beta * libm::sin(ea), 1.0 - beta * libm::cos(ea))
}

/// Solve Kepler's equation `M = E - e sin E` by Newton iteration.
pub fn ma_to_ea(ma: f64, e: f64, tol: f64, maxiter: u64) -> f64 {
    let mut ea_new = if e > 0.8 { consts::PI } else { ma };

    let mut iter = 0;
    while iter < maxiter {
        let ea = ea_new;
        ea_new = ea + (ma - ea + e * libm::sin(ea)) / (1.0 - e * libm::cos(ea));

        if (ea_new - ea).abs() < tol {
            break;
        }

        iter += 1;
    }
    ea_new
}

pub fn ha_to_ta(ha: f64, e: f64) -> f64 {
    2.0 * libm::atan(libm::sqrt((e + 1.0) / (e - 1.0)) * libm::tanh(ha / 2.0))
}

/// Solve the hyperbolic Kepler equation `M = e sinh H - H` by Newton
/// iteration.
pub fn ma_to_ha(ma: f64, e: f64, tol: f64, maxiter: u64) -> f64 {
    let mut ha_new = libm::asinh(ma / e);

    let mut iter = 0;
    while iter < maxiter {
        let ha = ha_new;
        ha_new = ha - (e * libm::sinh(ha) - ha - ma) / (e * libm::cosh(ha) - 1.0);

        if (ha_new - ha).abs() < tol {
            break;
        }

        iter += 1;
    }
    ha_new
}
