//! RX classification and the pending-transaction table.
//!
//! Every non-blocking SDO request registers the object address it expects an
//! echo for; the gateway matches each inbound response against the table once
//! and delivers it to exactly one consumer. Segments carry no address, so a
//! segmented transfer registers ownership per node instead.

use std::collections::HashMap;

use crate::sdo;
use crate::{Frame, GatewayError, NodeId};

/// Bootloader command frames ride this id.
pub const BOOTLOADER_CMD_ID: u16 = 0x7DD;
/// Bootloader responses ride this id.
pub const BOOTLOADER_RESP_ID: u16 = 0x7DE;

/// Coarse classification of an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxClass {
    /// SDO response window (`0x580..=0x5FF`).
    Sdo { node: NodeId },
    /// Bootloader dialogue response.
    Bootloader,
    /// Anything else; logged and dropped by the gateway.
    Other,
}

pub fn classify(frame: &Frame) -> RxClass {
    if sdo::is_response_id(frame.id) {
        RxClass::Sdo {
            node: sdo::response_node(frame.id),
        }
    } else if frame.id == BOOTLOADER_RESP_ID {
        RxClass::Bootloader
    } else {
        RxClass::Other
    }
}

/// Who asked for a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consumer {
    Connection,
    Discovery,
    SpotValues,
    /// The client-driven multi-round-trip query in flight (mapping dump,
    /// error list); at most one exists at a time.
    Query,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub node: NodeId,
    pub index: u16,
    pub sub: u8,
}

/// Table of in-flight transactions. One entry per object address; inserting
/// over a live entry replaces it (the older waiter already timed out or was
/// cancelled, its response will be dropped as unmatched).
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<PendingKey, Consumer>,
    /// At most one segmented transfer exists bus-wide; segments from this
    /// node route to this consumer.
    segment_owner: Option<(NodeId, Consumer)>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: PendingKey, consumer: Consumer) {
        if let Some(old) = self.entries.insert(key, consumer) {
            log::debug!("pending {key:?} replaced, previous waiter {old:?} dropped");
        }
    }

    /// Match a response address and remove the entry: deliver-once semantics.
    pub fn take(&mut self, key: PendingKey) -> Option<Consumer> {
        self.entries.remove(&key)
    }

    pub fn claim_segments(&mut self, node: NodeId, consumer: Consumer) {
        self.segment_owner = Some((node, consumer));
    }

    pub fn release_segments(&mut self) {
        self.segment_owner = None;
    }

    pub fn segment_consumer(&self, node: NodeId) -> Option<Consumer> {
        match self.segment_owner {
            Some((owner, consumer)) if owner == node => Some(consumer),
            _ => None,
        }
    }

    /// Drop every entry owned by one consumer (cancellation path).
    pub fn clear_consumer(&mut self, consumer: Consumer) {
        self.entries.retain(|_, c| *c != consumer);
        if matches!(self.segment_owner, Some((_, c)) if c == consumer) {
            self.segment_owner = None;
        }
    }

    /// Reconfiguration is only legal with nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.segment_owner.is_none()
    }
}

/// Progress of a multi-round-trip query (mapping dump, error list) that
/// yields to the loop at every SDO round-trip.
#[derive(Debug)]
pub enum QueryStatus<T> {
    Running,
    Done(T),
    Failed(GatewayError),
}
