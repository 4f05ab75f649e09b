//! Closed-form transfer geometry.
//!
//! Everything here is pure: inputs are orbital elements, radii and
//! gravitational parameters, outputs are angles (radians), durations
//! (seconds) and speeds (m/s).

use std::f64::consts;

use nalgebra::Vector3;
use time::Duration;

use crate::{kepler::orbits::Orbit, time::UT};

/// Relative angular rates below this (rad/s) are treated as
/// co-periodic.
pub const MIN_RELATIVE_RATE: f64 = 1e-10;

/// How the origin leaves for the transfer orbit.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Departure {
    /// Origin and destination share a reference body.
    Direct,
    /// The origin must escape its reference body with the given
    /// hyperbolic excess speed (m/s).
    Escape { excess_speed: f64 },
}

pub fn normalize_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(consts::TAU);
    // rem_euclid can round up to exactly TAU
    if a >= consts::TAU {
        0.0
    } else {
        a
    }
}

/// Two-body orbital period, or `None` if the orbit is not periodic.
pub fn orbital_period(sma: f64, mu: f64) -> Option<f64> {
    if sma <= 0.0 || mu <= 0.0 || !sma.is_finite() {
        return None;
    }
    Some(consts::TAU * libm::sqrt(sma.powi(3) / mu))
}

/// Time of flight of a Hohmann transfer between two circular orbits
/// with the given periods (half the transfer ellipse's period).
pub fn hohmann_flight_time(origin_period: f64, destination_period: f64) -> f64 {
    let transfer_period = ((libm::cbrt(origin_period.powi(2))
        + libm::cbrt(destination_period.powi(2)))
        / 2.0)
        .powf(1.5);
    transfer_period / 2.0
}

/// The angle the destination must lead the origin by at departure so
/// that it arrives at the transfer orbit's far apsis together with
/// the transferring craft. In `[0, 2π)`.
pub fn phase_angle(origin_period: f64, destination_period: f64) -> f64 {
    let flight_time = hohmann_flight_time(origin_period, destination_period);
    normalize_angle(consts::PI - consts::TAU * flight_time / destination_period)
}

/// Angle between the burn point and the escape direction, measured
/// backwards along the direction of motion. Zero for direct
/// transfers.
pub fn ejection_angle(origin_radius: f64, departure: Departure, mu: f64) -> f64 {
    match departure {
        Departure::Direct => 0.0,
        Departure::Escape { excess_speed } => {
            let e = 1.0 + origin_radius * excess_speed.powi(2) / mu;
            libm::acos(-1.0 / e)
        }
    }
}

/// Speed at `r` on an orbit with semi-major axis `sma`.
pub fn vis_viva(r: f64, sma: f64, mu: f64) -> f64 {
    libm::sqrt(mu * (2.0 / r - 1.0 / sma))
}

/// Speed needed at periapsis radius `r` to leave with hyperbolic
/// excess `excess_speed`.
pub fn escape_periapsis_speed(r: f64, excess_speed: f64, mu: f64) -> f64 {
    libm::sqrt(excess_speed.powi(2) + 2.0 * mu / r)
}

/// Signed change of speed at `origin_radius` to enter a Hohmann
/// transfer toward `destination_radius`, starting from a circular
/// orbit. Positive when raising.
pub fn excess_speed(origin_radius: f64, destination_radius: f64, mu: f64) -> f64 {
    let transfer_sma = (origin_radius + destination_radius) / 2.0;
    vis_viva(origin_radius, transfer_sma, mu) - libm::sqrt(mu / origin_radius)
}

/// Transfer burn from `origin` toward `destination`, both around a
/// body with gravitational parameter `mu`, in the (prograde, normal,
/// radial) frame. `retrograde` marks an origin that circles the body
/// against the destination's sense, in which case the burn first
/// has to cancel the current speed.
pub fn transfer_delta_v(
    origin: &Orbit,
    destination: &Orbit,
    mu: f64,
    retrograde: bool,
) -> Vector3<f64> {
    let r1 = origin.sma;
    let r2 = destination.sma;
    let current = vis_viva(r1, origin.sma, mu);
    let transfer = vis_viva(r1, (r1 + r2) / 2.0, mu);
    if retrograde {
        Vector3::new(-(transfer + current), 0.0, 0.0)
    } else {
        Vector3::new(transfer - current, 0.0, 0.0)
    }
}

/// Delta-V to rotate a velocity of magnitude `velocity` by
/// `inclination_delta`.
pub fn plane_change_delta_v(inclination_delta: f64, velocity: f64) -> f64 {
    (2.0 * velocity * libm::sin(inclination_delta / 2.0)).abs()
}

/// Angle between the planes of two orbits.
pub fn relative_inclination(a: &Orbit, b: &Orbit) -> f64 {
    libm::acos(a.normal().dot(&b.normal()).clamp(-1.0, 1.0))
}

/// Seconds until the phase (destination angle minus origin angle)
/// reaches `target_phase`, when it changes at `relative_rate` rad/s.
/// `None` if the two never align.
pub fn time_to_next_alignment(
    current_phase: f64,
    target_phase: f64,
    relative_rate: f64,
) -> Option<f64> {
    if relative_rate.abs() < MIN_RELATIVE_RATE || !relative_rate.is_finite() {
        return None;
    }
    let to_go = normalize_angle((target_phase - current_phase) * relative_rate.signum());
    Some(to_go / relative_rate.abs())
}

/// Closest approach between two orbits around the same body within
/// `[from, to]`: coarse sampling followed by golden-section
/// refinement. Returns the time and distance (m).
pub fn closest_approach(a: &Orbit, b: &Orbit, mu: f64, from: UT, to: UT) -> (UT, f64) {
    const SAMPLES: u32 = 256;
    const REFINE: u32 = 48;
    let span = (to - from).as_seconds_f64().max(0.0);
    let at = |t: f64| {
        let ut = from + Duration::seconds_f64(t);
        (a.position_at(ut, mu) - b.position_at(ut, mu)).norm()
    };

    let step = span / f64::from(SAMPLES);
    let (best, _) = (0..=SAMPLES)
        .map(|k| f64::from(k) * step)
        .map(|t| (t, at(t)))
        .fold((0.0, f64::INFINITY), |acc, x| if x.1 < acc.1 { x } else { acc });

    let inv_phi = (libm::sqrt(5.0) - 1.0) / 2.0;
    let (mut lo, mut hi) = ((best - step).max(0.0), (best + step).min(span));
    for _ in 0..REFINE {
        let c = hi - inv_phi * (hi - lo);
        let d = lo + inv_phi * (hi - lo);
        if at(c) < at(d) {
            hi = d;
        } else {
            lo = c;
        }
    }
    let t = (lo + hi) / 2.0;
    (from + Duration::seconds_f64(t), at(t))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;

    const MU: f64 = 3.5316e12;

    fn circ(r: f64) -> Orbit {
        Orbit::circular(Arc::from("Kerbin"), r, 0.0, 0.0, 0.0, UT::default())
    }

    #[test]
    fn period_rejects_open_orbits() {
        assert!(orbital_period(-1.0, MU).is_none());
        assert!(orbital_period(0.0, MU).is_none());
        assert!(orbital_period(1.0e6, 0.0).is_none());
        let t = orbital_period(1.3e6, MU).unwrap();
        assert_relative_eq!(t, consts::TAU * libm::sqrt(1.3e6f64.powi(3) / MU));
    }

    #[test]
    fn hohmann_delta_v_matches_closed_form() {
        for (r1, r2) in [(1.3e6, 2.0e6), (7.0e5, 1.2e7), (2.0e6, 4.7e7)] {
            let dv = transfer_delta_v(&circ(r1), &circ(r2), MU, false);
            let expected =
                libm::sqrt(MU / r1) * (libm::sqrt(2.0 * r2 / (r1 + r2)) - 1.0);
            assert_relative_eq!(dv.x, expected, max_relative = 1e-10);
            assert_eq!(dv.y, 0.0);
            assert_eq!(dv.z, 0.0);
            assert!(dv.x > 0.0);
        }
    }

    #[test]
    fn lowering_burn_is_retrograde() {
        let dv = transfer_delta_v(&circ(2.0e6), &circ(1.3e6), MU, false);
        assert!(dv.x < 0.0);
        let flipped = transfer_delta_v(&circ(1.3e6), &circ(2.0e6), MU, true);
        assert!(flipped.x < -libm::sqrt(MU / 1.3e6));
    }

    #[test]
    fn phase_angle_is_normalized_and_periodic() {
        let t1 = orbital_period(1.3e6, MU).unwrap();
        let t2 = orbital_period(1.2e7, MU).unwrap();
        let phase = phase_angle(t1, t2);
        assert!((0.0..consts::TAU).contains(&phase));
        assert_abs_diff_eq!(normalize_angle(phase + consts::TAU), phase, epsilon = 1e-12);

        let rate = consts::TAU / t2 - consts::TAU / t1;
        let base = time_to_next_alignment(0.3, phase, rate).unwrap();
        let shifted_target = time_to_next_alignment(0.3, phase + consts::TAU, rate).unwrap();
        let shifted_current = time_to_next_alignment(0.3 + consts::TAU, phase, rate).unwrap();
        assert_relative_eq!(base, shifted_target, max_relative = 1e-9);
        assert_relative_eq!(base, shifted_current, max_relative = 1e-9);
    }

    #[test]
    fn mun_phase_angle() {
        // Kerbin low orbit to Mun: the Mun should lead by roughly 110 degrees
        let t1 = orbital_period(7.0e5, MU).unwrap();
        let t2 = orbital_period(1.2e7, MU).unwrap();
        let phase = phase_angle(t1, t2).to_degrees();
        assert!((100.0..120.0).contains(&phase), "{phase}");
    }

    #[test]
    fn alignment_is_monotonic_in_target_phase() {
        let rate = 1e-4;
        let mut last = 0.0;
        for k in 0..64 {
            let target = 0.5 + f64::from(k) * consts::TAU / 64.0;
            let t = time_to_next_alignment(0.5, target, rate).unwrap();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn co_periodic_orbits_never_align() {
        assert!(time_to_next_alignment(0.0, 1.0, 0.0).is_none());
        assert!(time_to_next_alignment(0.0, 1.0, 1e-14).is_none());
        let t = time_to_next_alignment(1.0, 0.5, -0.25).unwrap();
        assert_relative_eq!(t, 2.0);
    }

    #[test]
    fn plane_change_at_ninety_degrees() {
        let dv = plane_change_delta_v(consts::FRAC_PI_2, 2000.0);
        assert_relative_eq!(dv, 1414.2135623730951, max_relative = 1e-12);
        assert_eq!(plane_change_delta_v(0.0, 2000.0), 0.0);
    }

    #[test]
    fn ejection_angle_geometry() {
        assert_eq!(ejection_angle(7.0e5, Departure::Direct, MU), 0.0);
        let slow = ejection_angle(7.0e5, Departure::Escape { excess_speed: 1.0 }, MU);
        let fast = ejection_angle(7.0e5, Departure::Escape { excess_speed: 5000.0 }, MU);
        assert!(slow > fast);
        assert!(slow <= consts::PI && fast > consts::FRAC_PI_2);
    }

    #[test]
    fn closest_approach_of_coplanar_circles() {
        let a = circ(1.0e6);
        let mut b = circ(1.5e6);
        b.mae = 1.0;
        let period = orbital_period(1.5e6, MU).unwrap();
        let (_, d) = closest_approach(
            &a,
            &b,
            MU,
            UT::default(),
            UT::new_seconds(4.0 * period),
        );
        assert_relative_eq!(d, 5.0e5, max_relative = 1e-4);
    }
}
