//! Autonomous navigation core for a small drone.
//!
//! This crate ingests GPS and magnetometer readings, synthesizes a moving
//! reference waypoint toward a commanded geodetic target and emits per-axis
//! steering commands as SBUS channel packets. A priority arbiter selects
//! between the pilot's transmitter frames and the autonomous frames on every
//! output cycle, so a human stick input always wins.
//!
//! The subsystems map onto the modules:
//!
//! - [`gps`] and [`compass`] own their device descriptors through background
//!   threads and publish sensor snapshots.
//! - [`control`] runs the position-control state machine and the proportional
//!   steering loop.
//! - [`server`] is the TCP command/telemetry endpoint for the ground station.
//! - [`sbus`] carries the frames, and [`arbiter`] decides whose frame flies.
//!
//! ## Configuration
//!
//! navcore is configured through `config.toml`. Please refer to the
//! [`config`] module for further information.
//!
//! ## Launcher
//!
//! The project has a launcher in `src/main.rs` and can be started by running
//! `cargo run`.

#![deny(clippy::all)]
#![forbid(anonymous_parameters)]
#![warn(clippy::pedantic)]
#![deny(
    unused_qualifications,
    unused_import_braces,
    trivial_numeric_casts,
    trivial_casts,
    missing_docs,
    unused_extern_crates
)]
#![allow(clippy::use_self, clippy::must_use_candidate)]

/// Configuration file.
pub const CONFIG_FILE: &str = "config.toml";

pub mod arbiter;
pub mod compass;
pub mod config;
pub mod control;
pub mod error;
pub mod geo;
pub mod gps;
pub mod sbus;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Error};
use colored::Colorize;

pub use crate::config::CONFIG;

/// The main logic of the program.
///
/// Brings up the SBUS link, the sensor services, the guidance controller and
/// the command endpoint, then hands the thread to the arbiter loop.
pub fn run() -> Result<(), Error> {
    let link = sbus::SbusLink::open(CONFIG.sbus().uart()).context(error::Sbus::Install)?;

    let gps = gps::Gps::init()?;
    let compass = compass::Compass::init()?;
    let controller = Arc::new(control::Controller::new(
        gps,
        compass,
        CONFIG.control().gains(),
    ));

    let _server = server::Server::spawn(Arc::clone(&controller), CONFIG.server().port())?;

    let mut arbiter = arbiter::Arbiter::new(link, controller);
    arbiter.run();

    Ok(())
}

/// Prints a stack trace of a complete system failure.
pub fn print_system_failure<S>(error: &Error, main_error: S)
where
    S: AsRef<str>,
{
    eprint!("{}", generate_error_string(error, main_error).red());
}

/// Generates a stack trace string of an error.
pub fn generate_error_string<S>(error: &Error, main_error: S) -> String
where
    S: AsRef<str>,
{
    let mut result = format!("{}:\n{}\n", main_error.as_ref(), error);

    for cause in error.chain().skip(1) {
        result.push_str(&format!("\tcaused by: {}\n", cause));
    }

    result
}
