//! Command endpoint module.
//!
//! A small TCP request/response server for the ground station: one JSON
//! document per read, one JSON document back. Commands mutate the guidance
//! controller (`TARGET`, `ABORT`) or snapshot it (`CONTROL_STATE`,
//! `TELEMETRY`). One client is served at a time, with a 10-second read
//! timeout.

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    compass::HeadingSource,
    control::{Controller, Target},
    error,
    gps::FixSource,
};

/// Read timeout for a connected client.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request buffer size; one JSON document per read.
const REQUEST_LIMIT: usize = 1024;

/// Poll interval of the accept loop, so the stop flag is observed.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Command endpoint service.
pub struct Server {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the endpoint and starts serving clients on a background thread.
    pub fn spawn<G, C>(controller: Arc<Controller<G, C>>, port: u16) -> Result<Server, Error>
    where
        G: FixSource + Send + Sync + 'static,
        C: HeadingSource + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .context(error::Server::Bind { port })?;
        listener
            .set_nonblocking(true)
            .context(error::Server::Bind { port })?;
        info!("command endpoint listening on port {}", port);

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("command-endpoint".to_owned())
                .spawn(move || serve_loop(&listener, &controller, &running))
                .context(error::Server::Bind { port })?
        };

        Ok(Server {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Accept loop: one serial client at a time.
fn serve_loop<G, C>(listener: &TcpListener, controller: &Controller<G, C>, running: &AtomicBool)
where
    G: FixSource,
    C: HeadingSource,
{
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("client connected from {}", peer);
                if let Err(e) = serve_client(stream, controller, running) {
                    warn!("client connection failed: {}", e);
                }
                info!("client disconnected");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => warn!("accept failed: {}", e),
        }
    }
}

/// Serves one client until it disconnects or times out.
fn serve_client<G, C>(
    mut stream: TcpStream,
    controller: &Controller<G, C>,
    running: &AtomicBool,
) -> io::Result<()>
where
    G: FixSource,
    C: HeadingSource,
{
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;

    let mut buffer = [0_u8; REQUEST_LIMIT];
    while running.load(Ordering::Relaxed) {
        let read = match stream.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        let request = String::from_utf8_lossy(&buffer[..read]);
        debug!("received command: {}", request.trim_end());
        let response = handle_command(controller, &request);
        stream.write_all(response.as_bytes())?;
    }
    Ok(())
}

/// Request envelope; only the command discriminator is needed up front.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    command: String,
}

/// TARGET request payload.
#[derive(Debug, Deserialize)]
struct TargetRequest {
    location: LocationRequest,
    heading: f64,
    speed: SpeedRequest,
}

#[derive(Debug, Deserialize)]
struct LocationRequest {
    lat: f64,
    lon: f64,
    alt: f64,
}

#[derive(Debug, Deserialize)]
struct SpeedRequest {
    linear: f64,
    yaw: f64,
    altitude: f64,
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
}

/// TELEMETRY response payload.
#[derive(Debug, Serialize)]
struct TelemetryReport {
    #[serde(rename = "type")]
    kind: &'static str,
    gps: GpsReport,
    compass: CompassReport,
}

#[derive(Debug, Serialize)]
struct GpsReport {
    lat: f64,
    lon: f64,
    altitude: f64,
    speed: f64,
    time: String,
    fix_quality: i32,
    satellites: i32,
    reliable: bool,
}

#[derive(Debug, Serialize)]
struct CompassReport {
    heading: f64,
}

/// Handles one JSON request and builds the JSON response.
fn handle_command<G, C>(controller: &Controller<G, C>, request: &str) -> String
where
    G: FixSource,
    C: HeadingSource,
{
    let envelope: Envelope = match serde_json::from_str(request) {
        Ok(envelope) => envelope,
        Err(e) => return error_reply(&e.to_string()),
    };

    match envelope.command.as_str() {
        "ABORT" => {
            controller.abort();
            confirmed()
        }
        "TARGET" => match serde_json::from_str::<TargetRequest>(request) {
            Ok(target) => {
                controller.set_target(Target {
                    latitude: target.location.lat,
                    longitude: target.location.lon,
                    altitude: target.location.alt,
                    heading: target.heading,
                    speed: target.speed.linear,
                    altitude_speed: target.speed.altitude,
                    yaw_speed: target.speed.yaw,
                });
                debug!("target accepted into state {:?}", controller.state());
                confirmed()
            }
            Err(e) => error_reply(&e.to_string()),
        },
        "CONTROL_STATE" => to_json(&controller.state_report()),
        "TELEMETRY" => {
            controller.gps().refresh();
            to_json(&telemetry_report(controller))
        }
        _ => error_reply("unknown request"),
    }
}

/// Snapshots the sensors for a TELEMETRY response.
fn telemetry_report<G, C>(controller: &Controller<G, C>) -> TelemetryReport
where
    G: FixSource,
    C: HeadingSource,
{
    let fix = controller.gps().fix();
    TelemetryReport {
        kind: "TELEMETRY",
        gps: GpsReport {
            lat: fix.latitude,
            lon: fix.longitude,
            altitude: fix.altitude_agl,
            speed: fix.speed,
            time: fix.time.clone(),
            fix_quality: fix.fix_quality,
            satellites: fix.satellites,
            reliable: fix.is_reliable(),
        },
        compass: CompassReport {
            heading: controller.compass().heading(),
        },
    }
}

fn confirmed() -> String {
    to_json(&Ack {
        status: "confirmed",
    })
}

fn error_reply(message: &str) -> String {
    to_json(&ErrorReply {
        error: message.to_owned(),
    })
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}
