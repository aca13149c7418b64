//! navcore launcher.
//!
//! Initializes logging (stdout plus a timestamped file under `data/logs/`),
//! loads the configuration and runs the navigation core. Initialization
//! failures are printed in red and exit with a nonzero status.

use std::{fs, path::PathBuf, process, sync::Arc};

use anyhow::{Context, Error};
use navcore::{error, print_system_failure, run, CONFIG};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Program entry point.
fn main() {
    if CONFIG.debug() {
        println!("Debug mode active");
    }

    if let Err(e) = init_loggers() {
        print_system_failure(&e, "Error initializing loggers");
        process::exit(1);
    }
    info!("navcore {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run() {
        print_system_failure(&e, "Error running navcore");
        process::exit(1);
    }
}

/// Initializes the logging subscriber.
fn init_loggers() -> Result<(), Error> {
    let now = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S");
    let log_path = PathBuf::from(format!("data/logs/main-{}.log", now));

    fs::create_dir_all("data/logs").context(error::Log::File {
        path: log_path.clone(),
    })?;
    let file = fs::File::create(&log_path).context(error::Log::File {
        path: log_path.clone(),
    })?;

    let default_level = if CONFIG.debug() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        .init();

    Ok(())
}
