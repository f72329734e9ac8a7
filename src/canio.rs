//! The CAN-IO periodic frame: throttle, digital I/O, cruise and regen
//! settings packed into one 8-byte frame with a rolling 2-bit counter and an
//! optional CRC marker.
//!
//! Bit layout (little-endian, bit 0 = LSB of byte 0):
//!
//! ```text
//! bits  0..=11  pot          (12 bits)
//! bits 12..=23  pot2         (12 bits)
//! bits 24..=29  canio        (6 bits)
//! bits 30..=31  counter      (2 bits, rolling)
//! bits 32..=45  cruisespeed  (14 bits)
//! bits 46..=53  regenpreset  (8 bits)
//! bits 54..=63  crc marker   (10 bits, zero when unused)
//! ```
//!
//! The marker is the low 10 bits of CRC-32 over the 7 low-order bytes with
//! the marker bits still zero. Receivers that verify must reject frames
//! whose marker does not recompute.

use std::time::Duration;

use crate::bus::{CanBus, TxStatus};
use crate::update::CRC32;
use crate::Frame;

/// The mutable field set. All fields are clamped to their bit widths when
/// packed, so a value that overflows its field can never corrupt a neighbor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanIoFlags {
    pub pot: u16,
    pub pot2: u16,
    pub canio: u8,
    pub cruisespeed: u16,
    pub regenpreset: u8,
}

/// Pack flags + counter into the wire payload.
pub fn pack(flags: &CanIoFlags, counter: u8, use_crc: bool) -> [u8; 8] {
    let mut word: u64 = 0;
    word |= flags.pot as u64 & 0xFFF;
    word |= (flags.pot2 as u64 & 0xFFF) << 12;
    word |= (flags.canio as u64 & 0x3F) << 24;
    word |= (counter as u64 & 0x3) << 30;
    word |= (flags.cruisespeed as u64 & 0x3FFF) << 32;
    word |= (flags.regenpreset as u64 & 0xFF) << 46;
    if use_crc {
        let marker = marker_of(word);
        word |= (marker as u64) << 54;
    }
    word.to_le_bytes()
}

/// Decode a payload back into `(flags, counter, marker)`.
pub fn unpack(data: &[u8; 8]) -> (CanIoFlags, u8, u16) {
    let word = u64::from_le_bytes(*data);
    let flags = CanIoFlags {
        pot: (word & 0xFFF) as u16,
        pot2: ((word >> 12) & 0xFFF) as u16,
        canio: ((word >> 24) & 0x3F) as u8,
        cruisespeed: ((word >> 32) & 0x3FFF) as u16,
        regenpreset: ((word >> 46) & 0xFF) as u8,
    };
    let counter = ((word >> 30) & 0x3) as u8;
    let marker = ((word >> 54) & 0x3FF) as u16;
    (flags, counter, marker)
}

/// Marker over a packed word with the marker bits cleared.
fn marker_of(word: u64) -> u16 {
    let masked = word & !(0x3FFu64 << 54);
    let bytes = masked.to_le_bytes();
    (CRC32.checksum(&bytes[..7]) & 0x3FF) as u16
}

/// Check the marker of a received payload. Frames built without a marker
/// carry zero there and fail this check unless the zero happens to match.
pub fn verify(data: &[u8; 8]) -> bool {
    let word = u64::from_le_bytes(*data);
    let marker = ((word >> 54) & 0x3FF) as u16;
    marker == marker_of(word)
}

/// The single CAN-IO periodic sender. The counter wraps in `{0,1,2,3}` and
/// restarts at 1 on every `start`, so a replayed final frame from a previous
/// session never matches the first frame of the next one.
#[derive(Default)]
pub struct CanIo {
    active: Option<CanIoTask>,
}

struct CanIoTask {
    can_id: u16,
    flags: CanIoFlags,
    use_crc: bool,
    period_ms: u64,
    last_send_ms: u64,
    counter: u8,
}

impl CanIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, can_id: u16, flags: CanIoFlags, period_ms: u64, use_crc: bool) {
        self.active = Some(CanIoTask {
            can_id,
            flags,
            use_crc,
            period_ms,
            last_send_ms: 0,
            counter: 1,
        });
    }

    /// Replace the live flag tuple. Ignored while stopped.
    pub fn update_flags(&mut self, flags: CanIoFlags) {
        if let Some(task) = &mut self.active {
            task.flags = flags;
        }
    }

    pub fn stop(&mut self) {
        self.active = None;
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Transmit when the period elapsed. Counter advances only on an actual
    /// send; a saturated TX queue retries the same counter next tick.
    pub fn send_if_due(&mut self, bus: &mut dyn CanBus, now_ms: u64) {
        let Some(task) = &mut self.active else {
            return;
        };
        if task.last_send_ms != 0 && now_ms.saturating_sub(task.last_send_ms) < task.period_ms {
            return;
        }
        let payload = pack(&task.flags, task.counter, task.use_crc);
        let frame = Frame {
            id: task.can_id,
            dlc: 8,
            data: payload,
        };
        match bus.transmit(&frame, Duration::ZERO) {
            TxStatus::Sent => {
                task.last_send_ms = now_ms;
                task.counter = (task.counter + 1) & 0x3;
            }
            TxStatus::Busy | TxStatus::Timeout => {
                log::warn!("CAN-IO frame delayed, TX queue full");
            }
        }
    }
}
