//! Device discovery: a cooperative node sweep plus passive heartbeat
//! tracking.
//!
//! The sweep sends one serial-part probe per tick (throttled to one probe
//! every 50 ms), waits for the routed response or a 100 ms timeout, and
//! wraps its cursor at the end of the range until stopped. Any SDO response
//! seen on the bus counts as a heartbeat for its node, throttled to one
//! bookkeeping update per second per node.

use std::collections::HashMap;
use std::time::Duration;

use crate::bus::{BusFilter, CanBus, TxStatus};
use crate::error::AbortKind;
use crate::event::{Event, EventSink};
use crate::router::{Consumer, PendingKey, PendingTable};
use crate::sdo::{self, SdoResponse, INDEX_SERIAL};
use crate::{serial_string, GatewayError, NodeId};

/// Gap between probes.
const PROBE_GAP_MS: u64 = 50;
/// Per-probe response deadline.
const PROBE_TIMEOUT_MS: u64 = 100;
/// Heartbeat bookkeeping throttle.
const HEARTBEAT_THROTTLE_MS: u64 = 1_000;

/// Effect for the gateway to apply: a node answered all four probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoEffect {
    Discovered { node: NodeId, serial: [u32; 4] },
}

#[derive(Default)]
pub struct Discovery {
    active: bool,
    start: NodeId,
    end: NodeId,
    node: NodeId,
    part: usize,
    parts: [u32; 4],
    waiting: bool,
    probe_sent_ms: u64,
    last_probe_ms: u64,
    last_seen: HashMap<NodeId, u64>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Begin (or restart) the sweep. The RX filter is widened to accept-all
    /// first, otherwise probes to unknown nodes would answer into a filter
    /// that drops them. An empty range terminates immediately.
    pub fn start(
        &mut self,
        bus: &mut dyn CanBus,
        events: &EventSink,
        range_start: NodeId,
        range_end: NodeId,
    ) -> Result<(), GatewayError> {
        if range_start > range_end {
            events.emit(Event::ScanProgress {
                node: range_start,
                done: true,
            });
            return Ok(());
        }
        bus.set_filter(BusFilter::AcceptAll)?;
        bus.clear_rx_until_quiet();
        self.active = true;
        self.start = range_start;
        self.end = range_end;
        self.node = range_start;
        self.part = 0;
        self.waiting = false;
        self.last_probe_ms = 0;
        Ok(())
    }

    /// Cancel the sweep. Immediate and idempotent; an in-flight probe
    /// response will be dropped as unmatched.
    pub fn stop(&mut self, pending: &mut PendingTable) {
        if self.active {
            pending.clear_consumer(Consumer::Discovery);
        }
        self.active = false;
        self.waiting = false;
    }

    /// One cooperative step: probe timeout handling, then at most one new
    /// probe per gap window.
    pub fn process(
        &mut self,
        bus: &mut dyn CanBus,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) {
        if !self.active {
            return;
        }
        if self.waiting {
            if now_ms.saturating_sub(self.probe_sent_ms) >= PROBE_TIMEOUT_MS {
                pending.clear_consumer(Consumer::Discovery);
                self.waiting = false;
                self.advance_node(events);
            }
            return;
        }
        if now_ms.saturating_sub(self.last_probe_ms) < PROBE_GAP_MS {
            return;
        }
        let frame = sdo::upload_request(self.node, INDEX_SERIAL, self.part as u8);
        if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
            bus.flush_tx();
            pending.register(
                PendingKey {
                    node: self.node,
                    index: INDEX_SERIAL,
                    sub: self.part as u8,
                },
                Consumer::Discovery,
            );
            self.waiting = true;
            self.probe_sent_ms = now_ms;
            self.last_probe_ms = now_ms;
        }
    }

    /// A routed response for the outstanding probe.
    pub fn on_sdo_response(
        &mut self,
        response: &SdoResponse,
        events: &EventSink,
        now_ms: u64,
    ) -> Option<DiscoEffect> {
        if !self.active || !self.waiting {
            return None;
        }
        self.waiting = false;
        self.last_probe_ms = now_ms;
        let value = match response {
            SdoResponse::UploadInitiate { payload, .. } => payload.as_u32(),
            _ => None,
        };
        let Some(value) = value else {
            // abort or a malformed answer: nobody home at this address
            if response.abort_kind() == Some(AbortKind::Generic) {
                log::debug!("node {} aborted a serial probe", self.node);
            }
            self.advance_node(events);
            return None;
        };
        self.parts[self.part] = value;
        self.part += 1;
        if self.part < 4 {
            return None;
        }
        let serial = self.parts;
        let node = self.node;
        events.emit(Event::DeviceDiscovered {
            node_id: node,
            serial: serial_string(&serial),
        });
        self.advance_node(events);
        Some(DiscoEffect::Discovered { node, serial })
    }

    fn advance_node(&mut self, events: &EventSink) {
        self.part = 0;
        self.node = if self.node >= self.end {
            self.start
        } else {
            self.node + 1
        };
        events.emit(Event::ScanProgress {
            node: self.node,
            done: false,
        });
    }

    /// Passive heartbeat: note traffic from a node, at most once per second.
    /// Returns `true` when the sighting is fresh enough to book.
    pub fn note_heartbeat(&mut self, node: NodeId, now_ms: u64) -> bool {
        match self.last_seen.get(&node) {
            Some(&t) if now_ms.saturating_sub(t) < HEARTBEAT_THROTTLE_MS => false,
            _ => {
                self.last_seen.insert(node, now_ms);
                true
            }
        }
    }
}
