//! Arbiter module.
//!
//! The main output loop. Every cycle it ticks the SBUS reader, feeds any
//! received pilot frame to the pilot watch, runs one controller tick and
//! writes exactly one frame to the flight controller: the pilot's frame while
//! the pilot is active, the controller's frame otherwise. Any stick input
//! latches autonomy off immediately.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    compass::HeadingSource,
    control::Controller,
    gps::FixSource,
    sbus::{SbusLink, SbusPacket, NEUTRAL},
};

/// Window without channel changes after which the pilot counts as inactive.
const PILOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the periodic state log line.
const STATE_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Tracks pilot activity from the received SBUS frames.
///
/// The pilot is considered active until [`PILOT_TIMEOUT`] elapses without a
/// change on any of the 16 channels; the first unchanged frame past the
/// window latches inactivity and logs once.
#[derive(Debug)]
pub struct PilotWatch {
    last_packet: SbusPacket,
    last_change: Instant,
    inactive: bool,
}

impl PilotWatch {
    /// Creates a watch with an all-zero last frame, so the first real frame
    /// registers as a change.
    #[must_use]
    pub fn new(now: Instant) -> PilotWatch {
        PilotWatch {
            last_packet: SbusPacket::default(),
            last_change: now,
            inactive: false,
        }
    }

    /// Feeds one received frame. Returns `true` when any channel changed.
    pub fn observe(&mut self, packet: &SbusPacket, now: Instant) -> bool {
        let changed = self.last_packet.channels != packet.channels;
        if changed {
            debug!("pilot frame changed: {:?}", packet.channels);
            self.last_packet = *packet;
            self.last_change = now;
            self.inactive = false;
        } else if !self.inactive && now.duration_since(self.last_change) > PILOT_TIMEOUT {
            self.inactive = true;
            info!("pilot inactive, autonomous control enabled");
        }
        changed
    }

    /// Checks whether the pilot currently holds control.
    #[must_use]
    pub fn pilot_active(&self) -> bool {
        !self.inactive
    }

    /// Gets the last received pilot frame.
    #[must_use]
    pub fn last_packet(&self) -> &SbusPacket {
        &self.last_packet
    }
}

/// The SBUS arbiter.
pub struct Arbiter<G, C> {
    link: SbusLink,
    controller: Arc<Controller<G, C>>,
    pilot: PilotWatch,
}

impl<G, C> Arbiter<G, C>
where
    G: FixSource,
    C: HeadingSource,
{
    /// Creates the arbiter around an installed SBUS link.
    pub fn new(link: SbusLink, controller: Arc<Controller<G, C>>) -> Arbiter<G, C> {
        Arbiter {
            link,
            controller,
            pilot: PilotWatch::new(Instant::now()),
        }
    }

    /// Runs the output loop. Does not return.
    pub fn run(&mut self) {
        let mut last_state_log = Instant::now();

        loop {
            if last_state_log.elapsed() > STATE_LOG_INTERVAL {
                info!("control loop state: {:?}", self.controller.state());
                last_state_log = Instant::now();
            }

            match self.link.poll() {
                Ok(Some(packet)) => {
                    // Stick input always wins over autonomy.
                    if self.pilot.observe(&packet, Instant::now()) {
                        self.controller.abort();
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("SBUS read error: {}", e),
            }

            self.controller.update_signals();

            let frame = if self.pilot.pilot_active() {
                *self.pilot.last_packet()
            } else {
                autonomous_frame(&self.controller)
            };
            if let Err(e) = self.link.write(&frame) {
                warn!("SBUS write error: {}", e);
            }
        }
    }
}

/// The controller's frame with the throttle channel pinned to neutral.
///
/// Altitude control is disabled at the integration level; the altitude state
/// machine still runs upstream.
fn autonomous_frame<G, C>(controller: &Controller<G, C>) -> SbusPacket
where
    G: FixSource,
    C: HeadingSource,
{
    let mut packet = controller.steering_packet();
    packet.channels[2] = NEUTRAL;
    packet
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        control::{Gains, PositionControlState, Target},
        gps::GeoFix,
    };

    struct DummyGps {
        fix: Mutex<GeoFix>,
    }

    impl FixSource for DummyGps {
        fn refresh(&self) {}

        fn fix(&self) -> GeoFix {
            self.fix.lock().unwrap().clone()
        }
    }

    struct DummyCompass;

    impl HeadingSource for DummyCompass {
        fn heading(&self) -> f64 {
            0.0
        }
    }

    fn active_controller() -> Controller<DummyGps, DummyCompass> {
        let controller = Controller::new(
            DummyGps {
                fix: Mutex::new(GeoFix {
                    latitude: 48.0,
                    longitude: 11.0,
                    altitude_agl: 20.0,
                    fix_quality: 1,
                    satellites: 8,
                    ..GeoFix::default()
                }),
            },
            DummyCompass,
            Gains::default(),
        );
        controller.set_target(Target {
            latitude: 48.01,
            longitude: 11.0,
            altitude: 20.0,
            heading: 0.0,
            speed: 10.0,
            altitude_speed: 0.0,
            yaw_speed: 0.0,
        });
        controller
    }

    fn frame_with_first_channel(value: u16) -> SbusPacket {
        let mut packet = SbusPacket {
            channels: [NEUTRAL; 16],
            ..SbusPacket::default()
        };
        packet.channels[0] = value;
        packet
    }

    /// A changed channel resets the window and reports the change.
    #[test]
    fn watch_detects_changes() {
        let start = Instant::now();
        let mut watch = PilotWatch::new(start);

        let frame = frame_with_first_channel(1024);
        assert!(watch.observe(&frame, start));
        assert!(watch.pilot_active());

        // Same frame again: no change.
        assert!(!watch.observe(&frame, start + Duration::from_secs(1)));
        assert!(watch.pilot_active());

        // Any single channel difference counts.
        assert!(watch.observe(
            &frame_with_first_channel(1025),
            start + Duration::from_secs(2)
        ));
        assert_eq!(watch.last_packet().channels[0], 1025);
    }

    /// Five seconds without changes latch the pilot inactive; the next stick
    /// input takes control back.
    #[test]
    fn watch_latches_inactive() {
        let start = Instant::now();
        let mut watch = PilotWatch::new(start);
        let frame = frame_with_first_channel(1024);

        assert!(watch.observe(&frame, start));
        assert!(!watch.observe(&frame, start + Duration::from_secs(4)));
        assert!(watch.pilot_active());

        assert!(!watch.observe(&frame, start + Duration::from_secs(6)));
        assert!(!watch.pilot_active());

        // Stick input reactivates the pilot window.
        assert!(watch.observe(
            &frame_with_first_channel(1300),
            start + Duration::from_secs(7)
        ));
        assert!(watch.pilot_active());
    }

    /// A pilot frame differing on any channel aborts an active controller and
    /// the arbitrated output becomes the pilot frame.
    #[test]
    fn pilot_override_aborts_autonomy() {
        let controller = active_controller();
        assert_eq!(controller.state(), PositionControlState::Active);

        let start = Instant::now();
        let mut watch = PilotWatch::new(start);
        let frame = frame_with_first_channel(1200);

        // The loop body: a changed frame aborts the controller.
        if watch.observe(&frame, start) {
            controller.abort();
        }

        assert_eq!(controller.state(), PositionControlState::Aborted);
        assert!(watch.pilot_active());
        assert_eq!(watch.last_packet(), &frame);
    }

    /// Autonomous frames always carry a neutral throttle channel.
    #[test]
    fn autonomous_frame_pins_throttle() {
        let controller = Arc::new(active_controller());
        // Let the moving reference pull ahead of the anchor before the tick.
        std::thread::sleep(Duration::from_millis(50));
        controller.update_signals();

        let packet = controller.steering_packet();
        assert_ne!(packet.channels[1], NEUTRAL, "pitch should be steering");

        let frame = autonomous_frame(&controller);
        assert_eq!(frame.channels[2], NEUTRAL);
        assert_eq!(frame.channels[0], packet.channels[0]);
        assert_eq!(frame.channels[1], packet.channels[1]);
        assert_eq!(frame.channels[3], packet.channels[3]);
    }
}
