//! Spot values: fixed-rate sampling of a parameter set with back-pressure
//! aware dispatch and batched delivery.
//!
//! Each cycle re-enqueues every subscribed parameter id in order; one SDO
//! request leaves per tick, and only if the rate limiter and TX queue accept
//! it. Responses land in both the cycle batch (flushed as one event per
//! cycle) and the latest-value cache that serves on-demand reads.

use std::collections::{BTreeMap, VecDeque};

use crate::bus::CanBus;
use crate::client::SdoLink;
use crate::event::{Event, EventSink};
use crate::params::{self, ParamId};
use crate::router::{Consumer, PendingKey, PendingTable};
use crate::sdo::SdoResponse;
use crate::NodeId;

#[derive(Default)]
pub struct SpotValues {
    active: bool,
    node: NodeId,
    owner: u32,
    param_ids: Vec<ParamId>,
    period_ms: u64,
    last_cycle_ms: u64,
    fifo: VecDeque<ParamId>,
    batch: BTreeMap<ParamId, f64>,
    latest: BTreeMap<ParamId, f64>,
    /// Timestamp of the last flushed batch; flushes are strictly monotonic.
    last_flush_ms: u64,
}

impl SpotValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn start(
        &mut self,
        node: NodeId,
        owner: u32,
        param_ids: Vec<ParamId>,
        period_ms: u64,
        events: &EventSink,
        now_ms: u64,
    ) {
        self.active = true;
        self.node = node;
        self.owner = owner;
        self.param_ids = param_ids;
        self.period_ms = period_ms.max(1);
        self.last_cycle_ms = now_ms;
        self.fifo = self.param_ids.iter().copied().collect();
        self.batch.clear();
        events.emit(Event::SpotValuesStatus {
            active: true,
            param_ids: self.param_ids.clone(),
            interval: self.period_ms,
        });
    }

    /// Stop sampling. The in-flight request (if any) is left to time out;
    /// its response is dropped as unmatched. No further batches are emitted.
    pub fn stop(&mut self, pending: &mut PendingTable, events: &EventSink) {
        if !self.active {
            return;
        }
        self.active = false;
        self.fifo.clear();
        self.batch.clear();
        pending.clear_consumer(Consumer::SpotValues);
        events.emit(Event::SpotValuesStatus {
            active: false,
            param_ids: self.param_ids.clone(),
            interval: self.period_ms,
        });
    }

    /// Cycle boundary: flush the accumulated batch as one event, then
    /// re-enqueue the whole parameter list.
    pub fn reload_if_due(&mut self, events: &EventSink, now_ms: u64) {
        if !self.active || now_ms.saturating_sub(self.last_cycle_ms) < self.period_ms {
            return;
        }
        self.last_cycle_ms = now_ms;
        if !self.batch.is_empty() {
            let timestamp = now_ms.max(self.last_flush_ms + 1);
            self.last_flush_ms = timestamp;
            events.emit(Event::SpotValues {
                values: std::mem::take(&mut self.batch),
                timestamp,
            });
        }
        // anything still queued from the previous cycle was never accepted
        // by the bus; start the new cycle clean rather than doubling up
        self.fifo = self.param_ids.iter().copied().collect();
    }

    /// Send at most one queued request, popping it only when the link
    /// actually accepted the transmit.
    pub fn dispatch_one(
        &mut self,
        bus: &mut dyn CanBus,
        link: &mut SdoLink,
        pending: &mut PendingTable,
        now_us: u64,
    ) {
        if !self.active {
            return;
        }
        let Some(&pid) = self.fifo.front() else {
            return;
        };
        let frame = params::upload_request(self.node, pid);
        if link.try_send(bus, &frame, now_us).is_ok() {
            let (index, sub) = params::object_address(pid);
            pending.register(
                PendingKey {
                    node: self.node,
                    index,
                    sub,
                },
                Consumer::SpotValues,
            );
            self.fifo.pop_front();
        }
    }

    /// A routed response for one of our requests.
    pub fn on_sdo_response(&mut self, key_index: u16, key_sub: u8, response: &SdoResponse) {
        if !self.active {
            return;
        }
        let pid = ((key_index & 0xFF) << 8) | key_sub as u16;
        let raw = match response {
            SdoResponse::UploadInitiate { payload, .. } => payload.as_u32(),
            _ => None,
        };
        let Some(raw) = raw else {
            log::debug!("spot value {pid:#06x} failed: {response:?}");
            return;
        };
        let value = params::from_wire(raw);
        self.latest.insert(pid, value);
        self.batch.insert(pid, value);
    }

    /// Snapshot of the most recent successful responses.
    pub fn latest(&self) -> BTreeMap<ParamId, f64> {
        self.latest.clone()
    }
}
