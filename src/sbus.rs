//! SBUS module.
//!
//! Packet type and wire codec for the Futaba SBUS protocol: 25-byte frames
//! carrying 16 proportional channels of 11 bits each, two discrete channels
//! and the failsafe/frame-lost flags. [`SbusLink`] drives the UART at the
//! protocol's 100 kbaud 8E2 setting, resynchronizing on framing errors.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use anyhow::{Context, Error};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::error;

/// Neutral channel value, the centered stick position.
pub const NEUTRAL: u16 = 1024;

/// Frame length on the wire, in bytes.
const FRAME_LEN: usize = 25;
/// Frame header byte.
const HEADER: u8 = 0x0F;
/// Frame footer byte.
const FOOTER: u8 = 0x00;

/// SBUS line speed, fixed by the protocol.
const BAUD_RATE: u32 = 100_000;
/// Serial read timeout; keeps the arbiter loop ticking without pilot frames.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// One SBUS packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbusPacket {
    /// The 16 proportional channels, 11 bits each (0..2047).
    pub channels: [u16; 16],
    /// Discrete channel 17.
    pub ch17: bool,
    /// Discrete channel 18.
    pub ch18: bool,
    /// Failsafe flag.
    pub failsafe: bool,
    /// Frame-lost flag.
    pub frame_lost: bool,
}

impl SbusPacket {
    /// Encodes the packet into one wire frame.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0_u8; FRAME_LEN];
        frame[0] = HEADER;

        let mut bit = 0_usize;
        for channel in &self.channels {
            let value = channel & 0x07FF;
            for i in 0..11 {
                if value & (1 << i) != 0 {
                    frame[1 + bit / 8] |= 1 << (bit % 8);
                }
                bit += 1;
            }
        }

        let mut flags = 0_u8;
        if self.ch17 {
            flags |= 0x01;
        }
        if self.ch18 {
            flags |= 0x02;
        }
        if self.frame_lost {
            flags |= 0x04;
        }
        if self.failsafe {
            flags |= 0x08;
        }
        frame[23] = flags;
        frame[24] = FOOTER;

        frame
    }

    /// Decodes one wire frame, checking the length and the framing bytes.
    pub fn decode(frame: &[u8]) -> Result<SbusPacket, error::Sbus> {
        if frame.len() != FRAME_LEN || frame[0] != HEADER || frame[24] != FOOTER {
            return Err(error::Sbus::BadFrame);
        }

        let mut channels = [0_u16; 16];
        let mut bit = 0_usize;
        for channel in &mut channels {
            for i in 0..11 {
                if frame[1 + bit / 8] & (1 << (bit % 8)) != 0 {
                    *channel |= 1 << i;
                }
                bit += 1;
            }
        }

        let flags = frame[23];
        Ok(SbusPacket {
            channels,
            ch17: flags & 0x01 != 0,
            ch18: flags & 0x02 != 0,
            frame_lost: flags & 0x04 != 0,
            failsafe: flags & 0x08 != 0,
        })
    }
}

/// SBUS link over a UART.
///
/// Owns the serial descriptor for the lifetime of the link.
pub struct SbusLink {
    port: Box<dyn SerialPort>,
    buffer: Vec<u8>,
}

impl SbusLink {
    /// Installs the link on the given UART at the SBUS line settings.
    pub fn open(uart: &str) -> Result<SbusLink, Error> {
        let port = tokio_serial::new(uart, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .context(error::Sbus::Install)?;

        Ok(SbusLink {
            port,
            buffer: Vec::with_capacity(4 * FRAME_LEN),
        })
    }

    /// Reads whatever is pending on the UART and returns the most recent
    /// complete packet, if any. Returns `Ok(None)` when no full frame has
    /// arrived yet.
    pub fn poll(&mut self) -> io::Result<Option<SbusPacket>> {
        let mut chunk = [0_u8; 2 * FRAME_LEN];
        match self.port.read(&mut chunk) {
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
                {}
            Err(e) => return Err(e),
        }

        let (packet, skipped) = drain_frames(&mut self.buffer);
        if skipped > 0 {
            debug!("SBUS desync, skipped {} bytes", skipped);
        }
        Ok(packet)
    }

    /// Writes one packet to the UART.
    pub fn write(&mut self, packet: &SbusPacket) -> io::Result<()> {
        self.port.write_all(&packet.encode())
    }
}

/// Extracts every complete frame from the buffer, returning the last decoded
/// packet and the number of bytes skipped while resynchronizing.
fn drain_frames(buffer: &mut Vec<u8>) -> (Option<SbusPacket>, usize) {
    let mut packet = None;
    let mut skipped = 0_usize;

    while buffer.len() >= FRAME_LEN {
        match SbusPacket::decode(&buffer[..FRAME_LEN]) {
            Ok(decoded) => {
                packet = Some(decoded);
                let _ = buffer.drain(..FRAME_LEN);
            }
            Err(_) => {
                let _ = buffer.drain(..1);
                skipped += 1;
            }
        }
    }

    (packet, skipped)
}
