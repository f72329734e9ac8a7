//! Events flowing gateway -> clients. One sum type, serialized as a tagged
//! JSON object (`{"event": "...", "requestId": N, ...}`). Components push
//! into the bounded queue through [`EventSink`]; the transport task drains it.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::errlog::DeviceError;
use crate::mapping::CanMapping;
use crate::params::ParamId;
use crate::store::DeviceEntry;
use crate::NodeId;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// A node answered all four serial-part probes during a scan.
    DeviceDiscovered { node_id: NodeId, serial: String },
    /// Scan cursor moved; `done` marks the end of a sweep or a cancel.
    ScanProgress { node: NodeId, done: bool },
    /// The persisted device directory.
    DeviceList { devices: Vec<DeviceEntry> },
    /// Serial re-acquisition for the selected device finished.
    Connected { node_id: NodeId, serial: String },
    Disconnected { node_id: NodeId },
    /// Schema download progress; `total` is 0 when the device did not
    /// announce a size.
    JsonProgress { bytes: usize, total: usize },
    /// The parsed parameter schema of the connected device.
    ParamSchemaData {
        node_id: NodeId,
        schema: serde_json::Value,
    },
    /// Snapshot of the latest sampled values, on demand.
    ParamValues {
        node_id: NodeId,
        values: BTreeMap<ParamId, f64>,
    },
    /// One spot-value batch. Timestamps are strictly monotonic per session.
    SpotValues {
        values: BTreeMap<ParamId, f64>,
        timestamp: u64,
    },
    SpotValuesStatus {
        active: bool,
        param_ids: Vec<ParamId>,
        interval: u64,
    },
    /// Outcome of a setValue command; `result` is `ok` or an error kind.
    ValueSet {
        result: String,
        param_id: ParamId,
        value: f64,
    },
    /// Generic success for commands with no payload to return.
    Ack,
    /// Schema reload for a node that is not connected: queued, not done.
    ReloadDeferred { node_id: NodeId },
    ErrorList { errors: Vec<DeviceError> },
    CanMappings { mappings: Vec<CanMapping> },
    UpdateProgress { page: usize, total: usize },
    UpdateDone,
    /// A failed command, correlated by requestId.
    Error { kind: String, message: String },
    Pong,
}

/// An event plus its routing metadata. `client == None` broadcasts;
/// `request_id == 0` marks unsolicited emissions.
#[derive(Clone, Debug)]
pub struct OutboundEvent {
    pub client: Option<u32>,
    pub request_id: u32,
    pub event: Event,
}

/// Wire form: requestId folded into the tagged object.
#[derive(Serialize)]
struct WireEvent<'a> {
    #[serde(rename = "requestId")]
    request_id: u32,
    #[serde(flatten)]
    event: &'a Event,
}

/// Serialize an outbound event to its JSON line.
pub fn to_json(out: &OutboundEvent) -> String {
    serde_json::to_string(&WireEvent {
        request_id: out.request_id,
        event: &out.event,
    })
    // Event contains nothing a Serialize impl can fail on
    .unwrap_or_else(|e| format!(r#"{{"event":"error","kind":"io","message":"{e}"}}"#))
}

/// The single event sink components push into. Periodic emissions are fire
/// and forget; correlated replies block briefly before degrading to a drop,
/// so a wedged transport cannot stall the bus loop for long.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<OutboundEvent>,
}

const REPLY_PUSH_TIMEOUT: Duration = Duration::from_millis(100);

impl EventSink {
    pub fn new(tx: Sender<OutboundEvent>) -> Self {
        EventSink { tx }
    }

    /// Unsolicited broadcast (requestId 0).
    pub fn emit(&self, event: Event) {
        let out = OutboundEvent {
            client: None,
            request_id: 0,
            event,
        };
        if self.tx.try_send(out).is_err() {
            log::warn!("event queue full, dropping periodic event");
        }
    }

    /// Reply correlated to a client's request.
    pub fn reply(&self, client: u32, request_id: u32, event: Event) {
        let out = OutboundEvent {
            client: Some(client),
            request_id,
            event,
        };
        if self.tx.send_timeout(out, REPLY_PUSH_TIMEOUT).is_err() {
            log::warn!("event queue full, dropping reply for client {client}");
        }
    }
}
