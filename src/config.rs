//! Configuration module.
//!
//! The configuration is read from `config.toml` at the working directory of
//! the process and exposed through the global [`CONFIG`] static. Every option
//! is checked by [`Config::verify()`] before the static becomes usable, so the
//! rest of the crate can trust the values it reads.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Error};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::{control::Gains, error, print_system_failure, CONFIG_FILE};

/// Configuration object.
pub static CONFIG: Lazy<Config> = Lazy::new(|| match Config::from_file(CONFIG_FILE) {
    Err(e) => {
        print_system_failure(&e, "Error loading configuration");
        panic!("could not load the configuration");
    }
    Ok(c) => c,
});

/// Configuration object.
#[derive(Debug, Deserialize)]
pub struct Config {
    debug: bool,
    gps: Gps,
    sbus: Sbus,
    compass: Compass,
    server: Server,
    control: Control,
}

impl Config {
    /// Creates a new configuration object from a path.
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let file = File::open(path.as_ref()).context(error::Config::Open {
            path: path.as_ref().to_owned(),
        })?;
        let mut reader = BufReader::new(file);
        let mut contents = String::new();

        let _ = reader
            .read_to_string(&mut contents)
            .context(error::Config::Read {
                path: path.as_ref().to_owned(),
            })?;

        let config: Config = toml::from_str(&contents).context(error::Config::InvalidToml {
            path: path.as_ref().to_owned(),
        })?;

        if let (false, errors) = config.verify() {
            Err(error::Config::Invalid { errors }.into())
        } else {
            Ok(config)
        }
    }

    /// Verify the correctness of the configuration, and return a list of errors if invalid.
    fn verify(&self) -> (bool, String) {
        let mut errors = String::new();
        let mut ok = true;

        if self.gps.uart.is_empty() {
            ok = false;
            errors.push_str("GPS UART path must not be empty\n");
        }
        if self.gps.baud_rate == 0 {
            ok = false;
            errors.push_str("GPS baud rate must not be zero\n");
        }
        if self.sbus.uart.is_empty() {
            ok = false;
            errors.push_str("SBUS UART path must not be empty\n");
        }
        if !self.compass.mount_offset.is_finite() {
            ok = false;
            errors.push_str(&format!(
                "compass mount offset must be a finite angle, found {}\n",
                self.compass.mount_offset
            ));
        }
        if self.server.port == 0 {
            ok = false;
            errors.push_str("command endpoint port must not be zero\n");
        }

        for (name, gain) in [
            ("k_lat", self.control.k_lat),
            ("k_lon", self.control.k_lon),
            ("k_alt", self.control.k_alt),
            ("k_yaw", self.control.k_yaw),
        ] {
            if !gain.is_finite() || gain <= 0.0 {
                ok = false;
                errors.push_str(&format!(
                    "control gain {} must be positive, found {}\n",
                    name, gain
                ));
            }
        }

        (ok, errors)
    }

    /// Gets whether navcore should run in debug mode.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Gets the GPS configuration.
    pub fn gps(&self) -> &Gps {
        &self.gps
    }

    /// Gets the SBUS configuration.
    pub fn sbus(&self) -> &Sbus {
        &self.sbus
    }

    /// Gets the magnetometer configuration.
    pub fn compass(&self) -> &Compass {
        &self.compass
    }

    /// Gets the command endpoint configuration.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Gets the guidance controller configuration.
    pub fn control(&self) -> &Control {
        &self.control
    }
}

/// GPS configuration.
#[derive(Debug, Deserialize)]
pub struct Gps {
    uart: String,
    baud_rate: u32,
}

impl Gps {
    /// Gets the path of the GPS UART.
    pub fn uart(&self) -> &str {
        &self.uart
    }

    /// Gets the baud rate of the GPS UART.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

/// SBUS configuration.
#[derive(Debug, Deserialize)]
pub struct Sbus {
    uart: String,
}

impl Sbus {
    /// Gets the path of the SBUS UART.
    pub fn uart(&self) -> &str {
        &self.uart
    }
}

/// Magnetometer configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Compass {
    mount_offset: f64,
}

impl Compass {
    /// Gets the physical mounting offset of the magnetometer, in degrees.
    pub fn mount_offset(&self) -> f64 {
        self.mount_offset
    }
}

/// Command endpoint configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Server {
    port: u16,
}

impl Server {
    /// Gets the TCP port of the command endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Guidance controller configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Control {
    k_lat: f64,
    k_lon: f64,
    k_alt: f64,
    k_yaw: f64,
}

impl Control {
    /// Gets the proportional gains of the guidance controller.
    pub fn gains(&self) -> Gains {
        Gains {
            k_lat: self.k_lat,
            k_lon: self.k_lon,
            k_alt: self.k_alt,
            k_yaw: self.k_yaw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks the configuration shipped with the repository.
    #[test]
    fn load_config() {
        let config = Config::from_file("config.toml").unwrap();

        assert!(!config.debug());
        assert_eq!(config.gps().uart(), "/dev/serial0");
        assert_eq!(config.gps().baud_rate(), 115_200);
        assert_eq!(config.sbus().uart(), "/dev/ttyAMA1");
        assert!((config.compass().mount_offset() - 0.0).abs() < f64::EPSILON);
        assert_eq!(config.server().port(), 1337);

        let gains = config.control().gains();
        assert!((gains.k_lat - 66.0).abs() < f64::EPSILON);
        assert!((gains.k_lon - 66.0).abs() < f64::EPSILON);
        assert!((gains.k_alt - 33.0).abs() < f64::EPSILON);
        assert!((gains.k_yaw - 7.33).abs() < f64::EPSILON);
    }

    /// Checks that invalid options are listed by `verify()`.
    #[test]
    fn config_error() {
        let config = Config {
            debug: false,
            gps: Gps {
                uart: String::new(),
                baud_rate: 0,
            },
            sbus: Sbus {
                uart: String::new(),
            },
            compass: Compass {
                mount_offset: f64::NAN,
            },
            server: Server { port: 0 },
            control: Control {
                k_lat: 0.0,
                k_lon: -66.0,
                k_alt: f64::INFINITY,
                k_yaw: 7.33,
            },
        };
        let (verify, errors) = config.verify();

        assert!(!verify);
        assert!(errors.contains("GPS UART path must not be empty"));
        assert!(errors.contains("GPS baud rate must not be zero"));
        assert!(errors.contains("SBUS UART path must not be empty"));
        assert!(errors.contains("compass mount offset must be a finite angle"));
        assert!(errors.contains("command endpoint port must not be zero"));
        assert!(errors.contains("control gain k_lat must be positive, found 0"));
        assert!(errors.contains("control gain k_lon must be positive, found -66"));
        assert!(errors.contains("control gain k_alt must be positive, found inf"));
        assert!(!errors.contains("k_yaw"));
    }

    /// Checks the global configuration static.
    #[test]
    fn config_static() {
        assert!(!CONFIG.debug());
    }
}
