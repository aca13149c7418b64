//! Error module.

use std::path::PathBuf;

use thiserror::Error;

/// GPS errors.
#[derive(Debug, Clone, Error)]
pub enum Gps {
    /// GPS initialization error.
    #[error("an error occurred trying to initialize the GPS module")]
    Init,
    /// Invalid NMEA coordinate field.
    #[error("invalid NMEA coordinate '{coordinate}' with direction '{direction}'")]
    InvalidCoordinate {
        /// The coordinate field that could not be converted.
        coordinate: String,
        /// The hemisphere letter that was received.
        direction: char,
    },
}

/// Magnetometer errors.
#[derive(Debug, Clone, Copy, Error)]
pub enum Compass {
    /// Magnetometer initialization error.
    #[error("an error occurred trying to initialize the magnetometer")]
    Init,
    /// The device at the magnetometer address did not identify itself.
    #[error("magnetometer identity check failed, WHO_AM_I returned {found:#04x}")]
    Identity {
        /// The identity byte that was read.
        found: u8,
    },
}

/// SBUS link errors.
#[derive(Debug, Clone, Copy, Error)]
pub enum Sbus {
    /// Error installing the SBUS link on its UART.
    #[error("an error occurred trying to install the SBUS link")]
    Install,
    /// A frame failed the header/footer check.
    #[error("malformed SBUS frame")]
    BadFrame,
}

/// Command endpoint errors.
#[derive(Debug, Clone, Copy, Error)]
pub enum Server {
    /// Error binding the listening socket.
    #[error("could not bind the command endpoint on port {port}")]
    Bind {
        /// The configured port.
        port: u16,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum Config {
    /// Error opening the configuration file.
    #[error("error opening the configuration file at '{}'", .path.display())]
    Open {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Error reading the configuration file.
    #[error("error reading the configuration file at '{}'", .path.display())]
    Read {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Invalid TOML found in the configuration file.
    #[error("invalid TOML found in the configuration file at '{}'", .path.display())]
    InvalidToml {
        /// The path of the configuration file.
        path: PathBuf,
    },
    /// Invalid configuration options.
    #[error("the configuration is invalid:\n{errors}")]
    Invalid {
        /// The list of errors in the configuration.
        errors: String,
    },
}

/// Errors handling the logging setup.
#[derive(Debug, Clone, Error)]
pub enum Log {
    /// Error creating the log directory or file.
    #[error("error creating the log file at '{}'", .path.display())]
    File {
        /// The path of the log file.
        path: PathBuf,
    },
}
