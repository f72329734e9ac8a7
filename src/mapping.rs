//! CAN message map access over SDO.
//!
//! A mapping ties a parameter to a bit range of some CAN frame the device
//! transmits or receives. The device stores them in its object dictionary:
//! writes go to the tx/rx map roots, reads enumerate `0x3100 + i` until the
//! device aborts with unknown-index.
//!
//! Entry wire layout (three expedited words per entry):
//!   sub 0: CAN id
//!   sub 1: `paramId << 16 | offsetBits << 8 | lengthBits`
//!   sub 2: `round(gain * 1000)` as i32
//!   sub 3: direction (0 = tx, 1 = rx), read side only

use std::time::Duration;

use serde::Serialize;

use crate::bus::{CanBus, TxStatus};
use crate::clock::Clock;
use crate::client::SdoLink;
use crate::error::AbortKind;
use crate::router::{Consumer, PendingKey, PendingTable, QueryStatus};
use crate::sdo::{self, SdoResponse, INDEX_MAP_READ, INDEX_MAP_RX, INDEX_MAP_TX};
use crate::{GatewayError, NodeId};

/// Marker written to delete an entry in place.
const REMOVE_MARKER: u32 = 0xFFFF_FFFF;
/// Sub-index that clears a whole map direction.
const CLEAR_SUB: u8 = 0xFF;
/// Upper bound on enumeration; a healthy device has far fewer.
const MAX_ENTRIES: u16 = 64;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanMapping {
    pub is_rx: bool,
    pub can_id: u16,
    pub param_id: u16,
    pub offset_bits: u8,
    pub length_bits: u8,
    pub gain: f64,
}

pub fn pack_entry(param_id: u16, offset_bits: u8, length_bits: u8) -> u32 {
    (param_id as u32) << 16 | (offset_bits as u32) << 8 | length_bits as u32
}

pub fn unpack_entry(word: u32) -> (u16, u8, u8) {
    ((word >> 16) as u16, (word >> 8) as u8, word as u8)
}

pub fn gain_to_wire(gain: f64) -> u32 {
    ((gain * 1000.0).round() as i32) as u32
}

pub fn gain_from_wire(word: u32) -> f64 {
    (word as i32) as f64 / 1000.0
}

fn map_root(is_rx: bool) -> u16 {
    if is_rx {
        INDEX_MAP_RX
    } else {
        INDEX_MAP_TX
    }
}

/// Install a mapping: three expedited writes against the map root.
pub fn add(
    link: &mut SdoLink,
    bus: &mut dyn CanBus,
    clock: &dyn Clock,
    node: NodeId,
    m: &CanMapping,
    deadline: Duration,
) -> Result<(), GatewayError> {
    let root = map_root(m.is_rx);
    link.write_and_wait(bus, clock, node, root, 0, m.can_id as u32, deadline)?;
    link.write_and_wait(
        bus,
        clock,
        node,
        root,
        1,
        pack_entry(m.param_id, m.offset_bits, m.length_bits),
        deadline,
    )?;
    link.write_and_wait(bus, clock, node, root, 2, gain_to_wire(m.gain), deadline)
}

/// Delete one entry by its read-side address.
pub fn remove(
    link: &mut SdoLink,
    bus: &mut dyn CanBus,
    clock: &dyn Clock,
    node: NodeId,
    index: u8,
    subindex: u8,
    deadline: Duration,
) -> Result<(), GatewayError> {
    link.write_and_wait(
        bus,
        clock,
        node,
        INDEX_MAP_READ + index as u16,
        subindex,
        REMOVE_MARKER,
        deadline,
    )
}

/// Drop every mapping in one direction.
pub fn clear(
    link: &mut SdoLink,
    bus: &mut dyn CanBus,
    clock: &dyn Clock,
    node: NodeId,
    is_rx: bool,
    deadline: Duration,
) -> Result<(), GatewayError> {
    link.write_and_wait(bus, clock, node, map_root(is_rx), CLEAR_SUB, 0, deadline)
}

/// Cooperative map dump: one expedited read per tick, one entry every four
/// reads, done when the device reports unknown-index at a fresh entry.
pub struct MapReader {
    node: NodeId,
    entry: u16,
    sub: u8,
    can_id: u32,
    packed: u32,
    gain: u32,
    out: Vec<CanMapping>,
    waiting: bool,
    sent_ms: u64,
    started_ms: u64,
    pub client: u32,
    pub request_id: u32,
}

/// Whole-dump budget.
const DUMP_TIMEOUT_MS: u64 = 5_000;
/// Per-read retry window.
const READ_TIMEOUT_MS: u64 = 100;

impl MapReader {
    pub fn new(node: NodeId, client: u32, request_id: u32, now_ms: u64) -> Self {
        MapReader {
            node,
            entry: 0,
            sub: 0,
            can_id: 0,
            packed: 0,
            gain: 0,
            out: Vec::new(),
            waiting: false,
            sent_ms: 0,
            started_ms: now_ms,
            client,
            request_id,
        }
    }

    pub fn process(
        &mut self,
        bus: &mut dyn CanBus,
        pending: &mut PendingTable,
        now_ms: u64,
    ) -> QueryStatus<Vec<CanMapping>> {
        if now_ms.saturating_sub(self.started_ms) >= DUMP_TIMEOUT_MS {
            pending.clear_consumer(Consumer::Query);
            return QueryStatus::Failed(GatewayError::Timeout);
        }
        if self.waiting {
            if now_ms.saturating_sub(self.sent_ms) >= READ_TIMEOUT_MS {
                self.waiting = false; // resend below
            } else {
                return QueryStatus::Running;
            }
        }
        if self.entry >= MAX_ENTRIES {
            log::warn!("mapping dump capped at {MAX_ENTRIES} entries");
            return QueryStatus::Done(std::mem::take(&mut self.out));
        }
        let index = INDEX_MAP_READ + self.entry;
        let frame = sdo::upload_request(self.node, index, self.sub);
        if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
            pending.register(
                PendingKey {
                    node: self.node,
                    index,
                    sub: self.sub,
                },
                Consumer::Query,
            );
            self.waiting = true;
            self.sent_ms = now_ms;
        }
        QueryStatus::Running
    }

    pub fn on_sdo_response(&mut self, response: &SdoResponse) -> QueryStatus<Vec<CanMapping>> {
        self.waiting = false;
        match response.abort_kind() {
            Some(AbortKind::UnknownIndex) if self.sub == 0 => {
                // end of the table
                return QueryStatus::Done(std::mem::take(&mut self.out));
            }
            Some(kind) => return QueryStatus::Failed(GatewayError::Abort(kind)),
            None => {}
        }
        let value = match response {
            SdoResponse::UploadInitiate { payload, .. } => payload.as_u32(),
            _ => None,
        };
        let Some(value) = value else {
            return QueryStatus::Failed(GatewayError::Parse(
                "unexpected response shape in mapping dump".into(),
            ));
        };
        match self.sub {
            0 => self.can_id = value,
            1 => self.packed = value,
            2 => self.gain = value,
            _ => {
                let (param_id, offset_bits, length_bits) = unpack_entry(self.packed);
                self.out.push(CanMapping {
                    is_rx: value != 0,
                    can_id: self.can_id as u16,
                    param_id,
                    offset_bits,
                    length_bits,
                    gain: gain_from_wire(self.gain),
                });
                self.entry += 1;
                self.sub = 0;
                return QueryStatus::Running;
            }
        }
        self.sub += 1;
        QueryStatus::Running
    }
}
