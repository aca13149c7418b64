//! Geodesy helpers.
//!
//! Small pure functions shared by the guidance controller: great-circle
//! distance, initial bearing and the two angle conventions used across the
//! crate (signed wrap into `(-180, 180]` and compass normalization into
//! `[0, 360)`). All angles are in degrees, all distances in meters.

/// Earth radius used for great-circle math, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Computes the great-circle distance between two points, in meters.
///
/// Uses the haversine formula on a sphere of [`EARTH_RADIUS_M`].
#[must_use]
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Computes the initial bearing from the first point to the second, in
/// degrees, normalized to `[0, 360)`.
#[must_use]
pub fn initial_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlon = (lon2 - lon1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

    normalize_degrees(y.atan2(x).to_degrees())
}

/// Wraps an angle difference into `(-180, 180]` degrees.
#[must_use]
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Normalizes an angle into `[0, 360)` degrees.
#[must_use]
pub fn normalize_degrees(angle: f64) -> f64 {
    angle.rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks the haversine distance against hand-computed references.
    #[test]
    fn haversine_references() {
        // One millidegree of latitude at the equator.
        let d = haversine_m(0.0, 0.0, 0.001, 0.0);
        assert!((d - 111.195).abs() < 0.01, "got {}", d);

        // One full degree of longitude at the equator.
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_194.9).abs() < 1.0, "got {}", d);

        // Same point.
        assert!(haversine_m(48.0, 11.0, 48.0, 11.0).abs() < 1e-9);
    }

    /// Checks that longitude distances shrink with the cosine of the latitude.
    #[test]
    fn haversine_latitude_scaling() {
        let equator = haversine_m(0.0, 0.0, 0.0, 0.001);
        let at_60 = haversine_m(60.0, 0.0, 60.0, 0.001);
        assert!((at_60 / equator - 0.5).abs() < 1e-3);
    }

    /// Checks cardinal bearings.
    #[test]
    fn bearing_cardinal() {
        assert!((initial_bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 1e-9);
        assert!((initial_bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 1e-9);
        assert!((initial_bearing_deg(1.0, 0.0, 0.0, 0.0) - 180.0).abs() < 1e-9);
        assert!((initial_bearing_deg(0.0, 1.0, 0.0, 0.0) - 270.0).abs() < 1e-9);
    }

    /// Checks the signed wrap convention, `(-180, 180]`.
    #[test]
    fn wrap_convention() {
        assert!((wrap_degrees(0.0) - 0.0).abs() < 1e-12);
        assert!((wrap_degrees(180.0) - 180.0).abs() < 1e-12);
        assert!((wrap_degrees(-180.0) - 180.0).abs() < 1e-12);
        assert!((wrap_degrees(190.0) - -170.0).abs() < 1e-12);
        assert!((wrap_degrees(-190.0) - 170.0).abs() < 1e-12);
        assert!((wrap_degrees(360.0) - 0.0).abs() < 1e-12);
        assert!((wrap_degrees(10.0 - 350.0) - 20.0).abs() < 1e-12);
        assert!((wrap_degrees(350.0 - 10.0) - -20.0).abs() < 1e-12);
    }

    /// Checks wrap over the whole heading grid, one degree at a time.
    #[test]
    fn wrap_range() {
        let mut temp = 0.0_f64;
        while temp < 360.0 {
            let mut current = 0.0_f64;
            while current < 360.0 {
                let error = wrap_degrees(temp - current);
                assert!(error > -180.0 && error <= 180.0, "({}, {})", temp, current);
                // The wrapped error is congruent with the raw difference.
                let congruent = (error - (temp - current)).rem_euclid(360.0);
                assert!(congruent.abs() < 1e-9 || (congruent - 360.0).abs() < 1e-9);
                current += 7.0;
            }
            temp += 7.0;
        }
    }

    /// Checks compass normalization, `[0, 360)`.
    #[test]
    fn normalize_convention() {
        assert!((normalize_degrees(360.0) - 0.0).abs() < 1e-12);
        assert!((normalize_degrees(370.0) - 10.0).abs() < 1e-12);
        assert!((normalize_degrees(-10.0) - 350.0).abs() < 1e-12);
        assert!((normalize_degrees(720.5) - 0.5).abs() < 1e-12);
    }
}
