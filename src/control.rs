//! Guidance controller module.
//!
//! Owns the position-control state machine. While a target is active the
//! controller advances a time-parameterized moving reference from the anchor
//! (the position captured when the target was accepted) toward the commanded
//! target, and steers the drone at it with four proportional channels. When
//! the target is reached, aborted, or never armed, the output is the neutral
//! stick vector.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    compass::HeadingSource,
    geo,
    gps::{FixSource, GeoFix},
    sbus::{SbusPacket, NEUTRAL},
};

/// Steering saturation bounds.
const CHANNEL_MIN: i64 = 364;
/// Steering saturation bounds.
const CHANNEL_MAX: i64 = 1684;

/// Horizontal distance below which the target counts as reached, in meters.
const DISTANCE_THRESHOLD_M: f64 = 2.0;
/// Altitude error below which the target counts as reached, in meters.
const ALTITUDE_THRESHOLD_M: f64 = 5.0;
/// Heading error below which the target counts as reached, in degrees.
const HEADING_THRESHOLD_DEG: f64 = 5.0;

/// Reliable-fix retries when accepting a target (5 seconds total).
const FIX_RETRIES: u32 = 50;
/// Interval between reliable-fix retries.
const FIX_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Position control states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PositionControlState {
    /// Idle, the last target has been reached. Neutral output.
    Reached = 0,
    /// Tracking a target.
    Active = 1,
    /// Latched safe. Neutral output.
    Aborted = 2,
}

impl PositionControlState {
    fn from_u8(value: u8) -> PositionControlState {
        match value {
            1 => PositionControlState::Active,
            2 => PositionControlState::Aborted,
            _ => PositionControlState::Reached,
        }
    }
}

/// Proportional gains of the steering loop.
#[derive(Debug, Clone, Copy)]
pub struct Gains {
    /// Lateral (left-right) gain, full deflection around 10 m of error.
    pub k_lat: f64,
    /// Longitudinal (front-back) gain, full deflection around 10 m of error.
    pub k_lon: f64,
    /// Altitude (down-up) gain, full deflection around 20 m of error.
    pub k_alt: f64,
    /// Yaw gain, full deflection around 90° of error.
    pub k_yaw: f64,
}

impl Default for Gains {
    fn default() -> Gains {
        Gains {
            k_lat: 66.0,
            k_lon: 66.0,
            k_alt: 33.0,
            k_yaw: 7.33,
        }
    }
}

/// A commanded target with its rate limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Target {
    /// Target latitude, in degrees.
    pub latitude: f64,
    /// Target longitude, in degrees.
    pub longitude: f64,
    /// Target altitude above ground, in meters.
    pub altitude: f64,
    /// Target heading, in degrees `[0, 360]`.
    pub heading: f64,
    /// Desired horizontal speed, in km/h.
    pub speed: f64,
    /// Desired vertical speed, in km/h.
    pub altitude_speed: f64,
    /// Desired yaw rate, in degrees per second.
    pub yaw_speed: f64,
}

/// Position, heading and time captured at the moment a target was accepted.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    heading: f64,
    time: Instant,
}

/// The time-parameterized waypoint between the anchor and the target.
#[derive(Debug, Clone, Copy, Default)]
struct MovingReference {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    heading: f64,
}

/// Mutable controller state, guarded by the controller mutex.
#[derive(Debug, Default)]
struct Inner {
    target: Target,
    anchor: Option<Anchor>,
    reference: MovingReference,
    steering: [u16; 4],
}

/// Guidance controller.
///
/// Generic over its sensor views so the loop can be exercised without
/// hardware.
pub struct Controller<G, C> {
    gps: G,
    compass: C,
    gains: Gains,
    inner: Mutex<Inner>,
    // Mirrors the state stored under the mutex, so status queries never
    // contend with the target-acceptance retry window.
    state: AtomicU8,
    fix_retries: u32,
    fix_retry_interval: Duration,
}

impl<G, C> Controller<G, C>
where
    G: FixSource,
    C: HeadingSource,
{
    /// Creates a controller around the given sensor views.
    pub fn new(gps: G, compass: C, gains: Gains) -> Controller<G, C> {
        Controller {
            gps,
            compass,
            gains,
            inner: Mutex::new(Inner {
                steering: [NEUTRAL; 4],
                ..Inner::default()
            }),
            state: AtomicU8::new(PositionControlState::Reached as u8),
            fix_retries: FIX_RETRIES,
            fix_retry_interval: FIX_RETRY_INTERVAL,
        }
    }

    /// Shrinks the target-acceptance retry window for tests.
    #[cfg(test)]
    fn with_fix_retry(mut self, retries: u32, interval: Duration) -> Controller<G, C> {
        self.fix_retries = retries;
        self.fix_retry_interval = interval;
        self
    }

    /// Gets the GPS view of this controller.
    pub fn gps(&self) -> &G {
        &self.gps
    }

    /// Gets the compass view of this controller.
    pub fn compass(&self) -> &C {
        &self.compass
    }

    /// Gets the current position control state.
    pub fn state(&self) -> PositionControlState {
        PositionControlState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Accepts a new target.
    ///
    /// Validates the parameters, then polls the GPS until a reliable fix
    /// arrives or the retry window elapses. On success the current position
    /// becomes the anchor and the controller goes `Active`; on any failure it
    /// latches `Aborted`. The controller mutex is held for the whole retry
    /// window, so concurrent calls serialize behind it.
    pub fn set_target(&self, target: Target) {
        let mut inner = self.inner.lock().unwrap();

        if !validate_target_parameters(&target) {
            self.store_state(PositionControlState::Aborted);
            error!("invalid target parameters");
            return;
        }

        let mut reliable = false;
        for _ in 0..self.fix_retries {
            self.gps.refresh();
            if self.gps.fix().is_reliable() {
                reliable = true;
                break;
            }
            thread::sleep(self.fix_retry_interval);
        }

        if !reliable {
            let fix = self.gps.fix();
            self.store_state(PositionControlState::Aborted);
            error!(
                fix_quality = fix.fix_quality,
                satellites = fix.satellites,
                "failed to acquire a reliable GPS fix within the retry window"
            );
            return;
        }

        let fix = self.gps.fix();
        let heading = self.compass.heading();
        let anchor = Anchor {
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude_agl,
            heading,
            time: Instant::now(),
        };

        inner.target = target;
        inner.reference = MovingReference {
            latitude: anchor.latitude,
            longitude: anchor.longitude,
            altitude: anchor.altitude,
            heading: anchor.heading,
        };
        inner.anchor = Some(anchor);
        self.store_state(PositionControlState::Active);
        info!("position control active");
    }

    /// Aborts position control. Idempotent.
    pub fn abort(&self) {
        let _inner = self.inner.lock().unwrap();
        if self.state() != PositionControlState::Aborted {
            self.store_state(PositionControlState::Aborted);
            info!("position control aborted");
        }
    }

    /// Runs one control tick: refreshes the sensors, advances the moving
    /// reference and recomputes the steering channels.
    ///
    /// An unreliable fix skips the tick and keeps the previous outputs.
    pub fn update_signals(&self) {
        let mut inner = self.inner.lock().unwrap();

        if self.state() != PositionControlState::Active {
            inner.steering = [NEUTRAL; 4];
            return;
        }

        self.gps.refresh();
        let fix = self.gps.fix();
        if !fix.is_reliable() {
            warn!(
                fix_quality = fix.fix_quality,
                satellites = fix.satellites,
                "GPS data not reliable, skipping control tick"
            );
            return;
        }
        let heading = self.compass.heading();

        // The reached check runs against the final target, not the reference.
        if is_target_reached(&inner.target, &fix, heading) {
            inner.steering = [NEUTRAL; 4];
            self.store_state(PositionControlState::Reached);
            info!("position control reached the target");
            return;
        }

        let Some(anchor) = inner.anchor else {
            return;
        };
        let elapsed = anchor.time.elapsed().as_secs_f64();
        inner.reference = advance_reference(&anchor, &inner.target, elapsed);
        inner.steering = steering_channels(&self.gains, &fix, heading, &inner.reference);
    }

    /// Builds the output packet for the current state.
    ///
    /// Channel 5 is unused and pinned high, channel 6 keeps the orientation
    /// mode off, and channel 7 selects altitude-stabilized flight while
    /// active, GPS-hold otherwise.
    pub fn steering_packet(&self) -> SbusPacket {
        let inner = self.inner.lock().unwrap();
        let active = self.state() == PositionControlState::Active;

        let mut channels = [NEUTRAL; 16];
        if active {
            channels[..4].copy_from_slice(&inner.steering);
        }
        channels[4] = 1684;
        channels[5] = 1541;
        channels[6] = if active { 1024 } else { 1541 };

        SbusPacket {
            channels,
            ..SbusPacket::default()
        }
    }

    /// Builds the CONTROL_STATE snapshot.
    pub fn state_report(&self) -> ControlStateReport {
        let inner = self.inner.lock().unwrap();
        ControlStateReport {
            kind: "CONTROL_STATE",
            control_loop_state: self.state() as u8,
            target: TargetReport {
                lat: inner.target.latitude,
                long: inner.target.longitude,
                altitude: inner.target.altitude,
                heading: inner.target.heading,
            },
            temp_target: ReferenceReport {
                lat: inner.reference.latitude,
                lon: inner.reference.longitude,
                altitude: inner.reference.altitude,
                heading: inner.reference.heading,
            },
            desired_speed: inner.target.speed,
            desired_altitude_speed: inner.target.altitude_speed,
            desired_yaw_speed: inner.target.yaw_speed,
        }
    }

    /// Stores a new state. Callers hold the controller mutex.
    fn store_state(&self, state: PositionControlState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// CONTROL_STATE response payload.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ControlStateReport {
    /// Message discriminator, always `CONTROL_STATE`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Position control state: 0 reached, 1 active, 2 aborted.
    pub control_loop_state: u8,
    /// The commanded target.
    pub target: TargetReport,
    /// The current moving reference.
    pub temp_target: ReferenceReport,
    /// Desired horizontal speed, in km/h.
    pub desired_speed: f64,
    /// Desired vertical speed, in km/h.
    pub desired_altitude_speed: f64,
    /// Desired yaw rate, in degrees per second.
    pub desired_yaw_speed: f64,
}

/// Commanded target as reported on the wire.
///
/// The `long` key is historical; existing clients depend on it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TargetReport {
    /// Latitude, in degrees.
    pub lat: f64,
    /// Longitude, in degrees.
    pub long: f64,
    /// Altitude above ground, in meters.
    pub altitude: f64,
    /// Heading, in degrees.
    pub heading: f64,
}

/// Moving reference as reported on the wire.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReferenceReport {
    /// Latitude, in degrees.
    pub lat: f64,
    /// Longitude, in degrees.
    pub lon: f64,
    /// Altitude above ground, in meters.
    pub altitude: f64,
    /// Heading, in degrees.
    pub heading: f64,
}

/// Validates the commanded parameters. Only the heading range is enforced.
fn validate_target_parameters(target: &Target) -> bool {
    (0.0..=360.0).contains(&target.heading)
}

/// Checks whether the live position and heading are within the reached
/// thresholds of the final target.
fn is_target_reached(target: &Target, fix: &GeoFix, heading: f64) -> bool {
    let distance_error = geo::haversine_m(
        fix.latitude,
        fix.longitude,
        target.latitude,
        target.longitude,
    );
    let altitude_error = target.altitude - fix.altitude_agl;
    let heading_error = target.heading - heading;

    distance_error.abs() <= DISTANCE_THRESHOLD_M
        && altitude_error.abs() <= ALTITUDE_THRESHOLD_M
        && heading_error.abs() <= HEADING_THRESHOLD_DEG
}

/// Advances the moving reference `elapsed` seconds away from the anchor.
fn advance_reference(anchor: &Anchor, target: &Target, elapsed: f64) -> MovingReference {
    // Horizontal leg: step along the anchor-to-target bearing, clamping onto
    // the target once the traveled distance covers the whole leg.
    let distance_to_travel = target.speed * 1000.0 / 3600.0 * elapsed;
    let total_distance = geo::haversine_m(
        anchor.latitude,
        anchor.longitude,
        target.latitude,
        target.longitude,
    );
    let (latitude, longitude) = if distance_to_travel >= total_distance {
        (target.latitude, target.longitude)
    } else {
        let bearing = geo::initial_bearing_deg(
            anchor.latitude,
            anchor.longitude,
            target.latitude,
            target.longitude,
        )
        .to_radians();
        let delta_lat =
            distance_to_travel / geo::EARTH_RADIUS_M * 180.0 / std::f64::consts::PI * bearing.cos();
        let delta_lon = distance_to_travel / geo::EARTH_RADIUS_M * 180.0 / std::f64::consts::PI
            * bearing.sin()
            / anchor.latitude.to_radians().cos();
        (anchor.latitude + delta_lat, anchor.longitude + delta_lon)
    };

    // Altitude leg: climb or sink at the commanded rate, clamping onto the
    // target altitude.
    let altitude_to_climb = target.altitude_speed * 1000.0 / 3600.0 * elapsed;
    let altitude = if target.altitude < anchor.altitude {
        (anchor.altitude - altitude_to_climb).max(target.altitude)
    } else {
        (anchor.altitude + altitude_to_climb).min(target.altitude)
    };

    // Heading leg: rotate along the shorter arc, clamping onto the target
    // heading lifted into the interval around the anchor heading.
    let rotation = target.yaw_speed * elapsed;
    let clockwise = (target.heading - anchor.heading).rem_euclid(360.0);
    let counter_clockwise = (anchor.heading - target.heading).rem_euclid(360.0);
    let heading = if clockwise <= counter_clockwise {
        let mut heading = anchor.heading + rotation;
        let mut lifted_target = target.heading;
        if lifted_target < anchor.heading {
            lifted_target += 360.0;
        }
        if heading > lifted_target {
            heading = lifted_target;
        }
        geo::normalize_degrees(heading)
    } else {
        let mut heading = anchor.heading - rotation;
        let mut lifted_target = target.heading;
        if lifted_target > anchor.heading {
            lifted_target -= 360.0;
        }
        if heading < lifted_target {
            heading = lifted_target;
        }
        geo::normalize_degrees(heading)
    };

    MovingReference {
        latitude,
        longitude,
        altitude,
        heading,
    }
}

/// Computes the four proportional steering channels against the reference.
fn steering_channels(
    gains: &Gains,
    fix: &GeoFix,
    heading: f64,
    reference: &MovingReference,
) -> [u16; 4] {
    let distance_error = geo::haversine_m(
        fix.latitude,
        fix.longitude,
        reference.latitude,
        reference.longitude,
    );
    let altitude_error = reference.altitude - fix.altitude_agl;
    let heading_error = geo::wrap_degrees(reference.heading - heading);

    let target_bearing = geo::initial_bearing_deg(
        fix.latitude,
        fix.longitude,
        reference.latitude,
        reference.longitude,
    );
    let relative_bearing = geo::wrap_degrees(target_bearing - heading).to_radians();
    let forward_component = relative_bearing.cos();
    let lateral_component = relative_bearing.sin();

    [
        constrain(1024 + (gains.k_lat * distance_error * lateral_component) as i64),
        constrain(1024 + (gains.k_lon * distance_error * forward_component) as i64),
        constrain(1024 + (gains.k_alt * altitude_error) as i64),
        constrain(1024 + (gains.k_yaw * heading_error) as i64),
    ]
}

/// Saturates a channel value to the steering bounds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn constrain(value: i64) -> u16 {
    value.clamp(CHANNEL_MIN, CHANNEL_MAX) as u16
}
