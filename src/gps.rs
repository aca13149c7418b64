//! GPS module.
//!
//! A background reader owns the GPS UART and accumulates NMEA sentences byte
//! by byte. Sentences that pass the checksum are queued; [`Gps::update()`]
//! drains the queue and folds `$GNRMC`/`$GNGGA` sentences into the latest
//! [`GeoFix`]. The queue is bounded: under burst the oldest sentence is
//! dropped so the reader never blocks on a slow consumer.

use std::{
    collections::VecDeque,
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Error};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::{config::CONFIG, error};

/// Maximum number of queued sentences before the oldest is dropped.
const QUEUE_LIMIT: usize = 10;

/// Maximum accumulated line length, in bytes.
const LINE_LIMIT: usize = 256;

/// Serial read timeout, so the reader can observe the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A parsed GPS fix.
#[derive(Debug, Default, Clone)]
pub struct GeoFix {
    /// UTC time of the fix, as received on the wire (`hhmmss.sss`).
    pub time: String,
    /// Latitude, in degrees, `[-90, 90]`.
    pub latitude: f64,
    /// Longitude, in degrees, `[-180, 180]`.
    pub longitude: f64,
    /// Altitude above ground, in meters.
    pub altitude_agl: f64,
    /// Speed over ground, in knots.
    pub speed: f64,
    /// Course over ground, in degrees.
    pub course: f64,
    /// NMEA fix quality, 0 meaning no fix.
    pub fix_quality: i32,
    /// Number of satellites in use.
    pub satellites: i32,
}

impl GeoFix {
    /// Checks whether the fix is good enough to navigate on.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.fix_quality > 0 && self.satellites >= 4
    }
}

/// Read-only view of a fix source.
///
/// The guidance controller and the command endpoint consume GPS data through
/// this contract, so tests can drive them with an in-memory source.
pub trait FixSource {
    /// Drains pending sentences into the latest fix.
    fn refresh(&self);

    /// Returns a copy of the latest fix.
    fn fix(&self) -> GeoFix;
}

/// GPS service.
///
/// Owns the serial descriptor through its reader thread; dropping the service
/// stops the thread and closes the port.
pub struct Gps {
    shared: Arc<Mutex<GpsData>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Gps {
    /// Initializes the GPS: opens the UART raw at the configured baud rate and
    /// starts the reader thread.
    pub fn init() -> Result<Gps, Error> {
        info!("starting GPS serial connection on {}", CONFIG.gps().uart());
        let port = tokio_serial::new(CONFIG.gps().uart(), CONFIG.gps().baud_rate())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .context(error::Gps::Init)?;

        let shared = Arc::new(Mutex::new(GpsData::default()));
        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("gps-reader".to_owned())
                .spawn(move || read_loop(port, &shared, &running))
                .context(error::Gps::Init)?
        };
        info!("GPS serial connection started");

        Ok(Gps {
            shared,
            running,
            reader: Some(reader),
        })
    }

    /// Drains the queued sentences into the latest fix.
    pub fn update(&self) {
        let mut data = self.shared.lock().unwrap();
        while let Some(sentence) = data.queue.pop_front() {
            data.process_sentence(&sentence);
        }
    }
}

impl FixSource for Gps {
    fn refresh(&self) {
        self.update();
    }

    fn fix(&self) -> GeoFix {
        self.shared.lock().unwrap().fix.clone()
    }
}

impl Drop for Gps {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Sentence queue and parsed fix, shared between the reader and the consumers.
#[derive(Debug, Default)]
struct GpsData {
    queue: VecDeque<String>,
    fix: GeoFix,
}

impl GpsData {
    /// Queues a validated sentence, dropping the oldest one when full.
    fn enqueue(&mut self, sentence: String) {
        self.queue.push_back(sentence);
        if self.queue.len() > QUEUE_LIMIT {
            let _ = self.queue.pop_front();
        }
    }

    /// Dispatches one sentence by type.
    fn process_sentence(&mut self, sentence: &str) {
        if sentence.starts_with("$GNRMC") {
            self.process_rmc(sentence);
        } else if sentence.starts_with("$GNGGA") {
            self.process_gga(sentence);
        }
    }

    /// Folds a `$GNRMC` sentence into the fix.
    ///
    /// `$GNRMC,time,status,lat,N,lon,E,speed,course,date,…`
    fn process_rmc(&mut self, sentence: &str) {
        let fields: Vec<&str> = sentence.split(',').collect();
        if fields.len() < 10 || fields[2] != "A" || fields[1].is_empty() {
            debug!("skipping invalid or incomplete $GNRMC sentence");
            return;
        }

        let Some((latitude, longitude)) = parse_position(fields[3], fields[4], fields[5], fields[6])
        else {
            debug!("skipping out-of-range latitude or longitude in $GNRMC");
            return;
        };

        self.fix.time = fields[1].to_owned();
        self.fix.latitude = latitude;
        self.fix.longitude = longitude;
        self.fix.speed = fields[7].parse().unwrap_or_default();
        self.fix.course = fields[8].parse().unwrap_or_default();
    }

    /// Folds a `$GNGGA` sentence into the fix.
    ///
    /// `$GNGGA,time,lat,N,lon,E,quality,satellites,hdop,alt,M,geoid,M,…`
    fn process_gga(&mut self, sentence: &str) {
        let fields: Vec<&str> = sentence.split(',').collect();
        if fields.len() < 12 || fields[1].is_empty() {
            debug!("skipping invalid or incomplete $GNGGA sentence");
            return;
        }

        let parsed = (
            fields[6].parse::<i32>(),
            fields[7].parse::<i32>(),
            fields[8].parse::<f64>(),
            fields[9].parse::<f64>(),
            fields[11].parse::<f64>(),
        );
        let (Ok(fix_quality), Ok(satellites), Ok(_hdop), Ok(altitude), Ok(geoid)) = parsed else {
            debug!("skipping invalid or incomplete $GNGGA sentence");
            return;
        };

        let Some((latitude, longitude)) = parse_position(fields[2], fields[3], fields[4], fields[5])
        else {
            debug!("skipping out-of-range latitude or longitude in $GNGGA");
            return;
        };

        if !(-1000.0..=10000.0).contains(&altitude) {
            debug!("skipping invalid altitude in $GNGGA");
            return;
        }

        self.fix.time = fields[1].to_owned();
        self.fix.latitude = latitude;
        self.fix.longitude = longitude;
        self.fix.altitude_agl = altitude - geoid;
        self.fix.fix_quality = fix_quality;
        self.fix.satellites = satellites;
    }
}

/// Converts a latitude/longitude field pair, returning `None` when conversion
/// fails or the result is out of range.
fn parse_position(lat: &str, ns: &str, lon: &str, ew: &str) -> Option<(f64, f64)> {
    let ns = ns.chars().next()?;
    let ew = ew.chars().next()?;
    let latitude = convert_to_decimal_degrees(lat, ns).ok()?;
    let longitude = convert_to_decimal_degrees(lon, ew).ok()?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some((latitude, longitude))
}

/// Converts an NMEA coordinate to decimal degrees.
///
/// Latitude is encoded as `DDMM.mmmm`, longitude as `DDDMM.mmmm`; the degree
/// field width is chosen by the hemisphere letter, not by the string length.
/// `S` and `W` yield negative results.
pub fn convert_to_decimal_degrees(coordinate: &str, direction: char) -> Result<f64, error::Gps> {
    let invalid = || error::Gps::InvalidCoordinate {
        coordinate: coordinate.to_owned(),
        direction,
    };

    let degree_digits = match direction {
        'N' | 'S' => 2,
        'E' | 'W' => 3,
        _ => return Err(invalid()),
    };
    if coordinate.len() < 4 || !coordinate.is_ascii() {
        return Err(invalid());
    }

    let degrees: f64 = coordinate[..degree_digits].parse().map_err(|_| invalid())?;
    let minutes: f64 = coordinate[degree_digits..].parse().map_err(|_| invalid())?;
    let decimal = degrees + minutes / 60.0;

    Ok(if direction == 'S' || direction == 'W' {
        -decimal
    } else {
        decimal
    })
}

/// Validates an NMEA checksum: the XOR of all bytes strictly between `$` and
/// `*` must match the two hex digits following the `*`.
#[must_use]
pub fn validate_checksum(sentence: &str) -> bool {
    if !sentence.starts_with('$') {
        return false;
    }
    let Some(star) = sentence.find('*') else {
        return false;
    };
    if star < 1 {
        return false;
    }

    let computed = sentence.as_bytes()[1..star]
        .iter()
        .fold(0_u8, |checksum, byte| checksum ^ byte);
    let Some(received) = sentence.get(star + 1..star + 3) else {
        return false;
    };
    u8::from_str_radix(received, 16).is_ok_and(|received| received == computed)
}

/// Reader loop: accumulates bytes to LF, validates and queues sentences.
fn read_loop(mut port: Box<dyn SerialPort>, shared: &Mutex<GpsData>, running: &AtomicBool) {
    let mut line = Vec::with_capacity(LINE_LIMIT);
    let mut byte = [0_u8; 1];

    while running.load(Ordering::Relaxed) {
        match port.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => {
                if byte[0] == b'\n' {
                    let sentence = String::from_utf8_lossy(&line).trim_end().to_owned();
                    line.clear();
                    if validate_checksum(&sentence) {
                        shared.lock().unwrap().enqueue(sentence);
                    } else if !sentence.is_empty() {
                        debug!("dropping NMEA sentence with bad checksum: {}", sentence);
                    }
                } else if line.len() < LINE_LIMIT {
                    line.push(byte[0]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
                {}
            Err(e) => warn!("GPS serial read failed: {}", e),
        }
    }
}
