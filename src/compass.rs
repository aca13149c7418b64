//! Magnetometer module.
//!
//! Drives an IST8310 3-axis magnetic sensor over I²C in single-measurement
//! mode and derives a planar heading from the X/Y components. A background
//! poller owns the bus handle; consumers read the last stored heading through
//! [`HeadingSource`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Error};
use rppal::i2c::I2c;
use tracing::{debug, info, warn};

use crate::{config::CONFIG, error, geo};

/// IST8310 I²C address.
const IST8310_ADDR: u16 = 0x0E;
/// Identity register.
const IST8310_WHO_AM_I: u8 = 0x00;
/// Expected identity byte.
const IST8310_DEVICE_ID: u8 = 0x10;
/// Control register; writing [`SINGLE_MEASUREMENT`] triggers one measurement.
const IST8310_CTRL1: u8 = 0x0A;
/// Single-measurement mode command.
const SINGLE_MEASUREMENT: u8 = 0x01;
/// X axis LSB register (MSB follows).
const IST8310_X_LSB: u8 = 0x03;
/// Y axis LSB register (MSB follows).
const IST8310_Y_LSB: u8 = 0x05;

/// Polling cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Wait for a single measurement to complete.
const MEASUREMENT_WAIT: Duration = Duration::from_millis(10);

/// Read-only view of a heading source.
pub trait HeadingSource {
    /// Returns the last measured heading, in degrees `[0, 360)`.
    fn heading(&self) -> f64;
}

/// Magnetometer service.
///
/// The poller thread owns the I²C handle; dropping the service stops the
/// thread and closes the bus.
pub struct Compass {
    shared: Arc<Mutex<CompassData>>,
    running: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct CompassData {
    heading: f64,
    x: i16,
    y: i16,
}

impl Compass {
    /// Initializes the magnetometer: opens the I²C bus, checks the device
    /// identity and starts the poller thread.
    pub fn init() -> Result<Compass, Error> {
        info!("initializing magnetometer on the default I2C bus");
        let mut bus = I2c::new().context(error::Compass::Init)?;
        bus.set_slave_address(IST8310_ADDR)
            .context(error::Compass::Init)?;

        let identity = bus
            .smbus_read_byte(IST8310_WHO_AM_I)
            .context(error::Compass::Init)?;
        if identity != IST8310_DEVICE_ID {
            return Err(error::Compass::Identity { found: identity }.into());
        }

        let mount_offset = CONFIG.compass().mount_offset();
        let shared = Arc::new(Mutex::new(CompassData::default()));
        let running = Arc::new(AtomicBool::new(true));
        let poller = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("compass-poller".to_owned())
                .spawn(move || poll_loop(bus, mount_offset, &shared, &running))
                .context(error::Compass::Init)?
        };
        info!("magnetometer initialized");

        Ok(Compass {
            shared,
            running,
            poller: Some(poller),
        })
    }
}

impl HeadingSource for Compass {
    fn heading(&self) -> f64 {
        self.shared.lock().unwrap().heading
    }
}

impl Drop for Compass {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}

/// Poller loop: one single-measurement cycle every [`POLL_INTERVAL`].
///
/// The I²C transaction runs without the lock; only the result store takes it.
/// Runtime bus errors keep the previous value visible.
fn poll_loop(mut bus: I2c, mount_offset: f64, shared: &Mutex<CompassData>, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        match sample(&mut bus) {
            Ok((x, y)) => {
                let heading = heading_from_raw(x, y, mount_offset);
                debug!(x, y, heading, "magnetometer sample");

                let mut data = shared.lock().unwrap();
                data.heading = heading;
                data.x = x;
                data.y = y;
            }
            Err(e) => warn!("magnetometer read failed: {}", e),
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Requests one measurement and reads the X/Y components.
fn sample(bus: &mut I2c) -> Result<(i16, i16), rppal::i2c::Error> {
    bus.smbus_write_byte(IST8310_CTRL1, SINGLE_MEASUREMENT)?;
    thread::sleep(MEASUREMENT_WAIT);

    let x = read_axis(bus, IST8310_X_LSB)?;
    let y = read_axis(bus, IST8310_Y_LSB)?;
    Ok((x, y))
}

/// Reads one axis as a little-endian signed 16-bit register pair.
fn read_axis(bus: &mut I2c, register: u8) -> Result<i16, rppal::i2c::Error> {
    let low = bus.smbus_read_byte(register)?;
    let high = bus.smbus_read_byte(register + 1)?;
    Ok(i16::from_le_bytes([low, high]))
}

/// Derives the planar heading from raw X/Y components, in degrees `[0, 360)`.
fn heading_from_raw(x: i16, y: i16, mount_offset: f64) -> f64 {
    let heading = f64::from(y).atan2(f64::from(x)).to_degrees() - 90.0 + mount_offset;
    geo::normalize_degrees(heading)
}

#[cfg(test)]
mod tests {
    use super::heading_from_raw;

    /// Checks the heading formula on the cardinal axes.
    #[test]
    fn heading_cardinal() {
        // Field along +Y points the sensor at magnetic north.
        assert!((heading_from_raw(0, 1000, 0.0) - 0.0).abs() < 1e-9);
        // Field along +X.
        assert!((heading_from_raw(1000, 0, 0.0) - 270.0).abs() < 1e-9);
        // Field along -Y.
        assert!((heading_from_raw(0, -1000, 0.0) - 180.0).abs() < 1e-9);
        // Field along -X.
        assert!((heading_from_raw(-1000, 0, 0.0) - 90.0).abs() < 1e-9);
    }

    /// Checks that the mounting offset shifts and normalizes the result.
    #[test]
    fn heading_mount_offset() {
        assert!((heading_from_raw(0, 1000, 45.0) - 45.0).abs() < 1e-9);
        assert!((heading_from_raw(0, 1000, -45.0) - 315.0).abs() < 1e-9);
        assert!((heading_from_raw(1000, 0, 180.0) - 90.0).abs() < 1e-9);
    }
}
