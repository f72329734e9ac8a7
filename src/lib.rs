//! # Canbridge
//! A gateway between framed message clients (a browser, a test rig) and a fleet
//! of CANopen-SDO devices hanging off one shared two-wire CAN bus.
//!
//! # Shape
//! One cooperative [`gateway::Gateway`] task owns the bus and every protocol
//! state machine; clients talk to it only through two bounded queues (commands
//! in, events out). Everything long-running - schema downloads, firmware
//! updates, node sweeps - is a state machine advanced once per loop tick, so
//! the bus never disappears under a blocked caller.
//!
//! # Layers
//! * [`bus`] - frame I/O behind the [`bus::CanBus`] seam (socketcan backend)
//! * [`sdo`] - the pure SDO codec: build requests, classify responses
//! * [`client`] - write-and-wait / request-and-wait composition + rate limit
//! * [`connection`], [`discovery`], [`interval`], [`spot`], [`update`] - the
//!   per-subsystem state machines
//! * [`gateway`] - the loop that strings them together

use std::fmt;

pub mod bus;
pub mod canio;
pub mod client;
pub mod clock;
pub mod command;
pub mod connection;
pub mod discovery;
pub mod errlog;
pub mod error;
pub mod event;
pub mod gateway;
pub mod interval;
pub mod lock;
pub mod mapping;
pub mod params;
pub mod router;
pub mod sdo;
pub mod spot;
pub mod store;
pub mod update;

pub use bus::{BusConfig, BusFilter, CanBus, SocketCanBus, TxStatus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{AbortKind, GatewayError};
pub use gateway::{Gateway, GatewayConfig};

/// Device address on the bus. `0` means "no device selected".
pub type NodeId = u8;

/// Highest valid node id (7-bit CANopen address space).
pub const NODE_ID_MAX: NodeId = 127;

/// Bus bitrate. The hardware only supports the classic trio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaudRate {
    B125k,
    B250k,
    B500k,
}

impl BaudRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B125k => 125_000,
            BaudRate::B250k => 250_000,
            BaudRate::B500k => 500_000,
        }
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        BaudRate::B500k
    }
}

/// A standard CAN 2.0A frame. Extended (29-bit) ids never appear on this bus,
/// so the id is plain `u16` and anything above 0x7FF is rejected at
/// construction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl Frame {
    /// Build a frame from a payload slice. Fails on an out-of-range id or a
    /// payload longer than 8 bytes.
    pub fn new(id: u16, payload: &[u8]) -> Result<Frame, GatewayError> {
        if id > 0x7FF {
            return Err(GatewayError::Parse(format!(
                "{id:#x} does not fit in an 11-bit identifier"
            )));
        }
        if payload.len() > 8 {
            return Err(GatewayError::Parse(format!(
                "payload of {} bytes does not fit a classic frame",
                payload.len()
            )));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Frame {
            id,
            dlc: payload.len() as u8,
            data,
        })
    }

    /// The payload, trimmed to the wire length.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#", self.id)?;
        for b in self.payload() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Canonical display form of a four-word serial number,
/// e.g. `00000005:32315110:34303539:34303539`.
pub fn serial_string(parts: &[u32; 4]) -> String {
    format!(
        "{:08x}:{:08x}:{:08x}:{:08x}",
        parts[0], parts[1], parts[2], parts[3]
    )
}

/// Inverse of [`serial_string`]. `None` when the text is not four
/// colon-separated hex words.
pub fn parse_serial(text: &str) -> Option<[u32; 4]> {
    let mut parts = [0u32; 4];
    let mut n = 0;
    for word in text.split(':') {
        if n == 4 {
            return None;
        }
        parts[n] = u32::from_str_radix(word, 16).ok()?;
        n += 1;
    }
    if n == 4 {
        Some(parts)
    } else {
        None
    }
}
