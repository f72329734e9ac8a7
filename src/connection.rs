//! The per-device connection: serial-number acquisition and the segmented
//! schema (JSON blob) download, as a non-blocking state machine advanced once
//! per gateway tick.
//!
//! The schema buffer lives behind a mutex because the transport task may
//! snapshot progress while the gateway appends; everything else is owned
//! exclusively by the gateway.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{CanBus, TxStatus};
use crate::error::AbortKind;
use crate::event::{Event, EventSink};
use crate::router::{Consumer, PendingKey, PendingTable};
use crate::sdo::{self, SdoResponse, UploadPayload, INDEX_SERIAL, INDEX_STRINGS};
use crate::{serial_string, GatewayError, NodeId};

/// Schema transfer lifecycle as one tagged sum. Readers copy out of it;
/// only the connection writes.
pub enum SchemaState {
    Idle,
    Downloading { buf: Vec<u8>, total: usize },
    Ready { blob: String },
}

/// Shared handle on the schema buffer.
#[derive(Clone)]
pub struct SharedSchema {
    inner: Arc<Mutex<SchemaState>>,
}

impl SharedSchema {
    pub fn new() -> Self {
        SharedSchema {
            inner: Arc::new(Mutex::new(SchemaState::Idle)),
        }
    }

    fn begin(&self, total: usize) {
        *self.lock() = SchemaState::Downloading {
            buf: Vec::with_capacity(total),
            total,
        };
    }

    fn append(&self, bytes: &[u8]) {
        if let SchemaState::Downloading { buf, .. } = &mut *self.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    fn finish(&self) -> Result<serde_json::Value, GatewayError> {
        let mut state = self.lock();
        let SchemaState::Downloading { buf, .. } = &*state else {
            return Err(GatewayError::BadState("no schema download active".into()));
        };
        let blob = String::from_utf8(buf.clone())
            .map_err(|e| GatewayError::Parse(format!("schema is not UTF-8: {e}")))?;
        let parsed: serde_json::Value = serde_json::from_str(&blob)
            .map_err(|e| GatewayError::Parse(format!("schema is not valid JSON: {e}")))?;
        *state = SchemaState::Ready { blob };
        Ok(parsed)
    }

    /// Truncate the buffer and reset the size hint.
    pub fn clear(&self) {
        *self.lock() = SchemaState::Idle;
    }

    /// `(bytes, total)` while a download runs.
    pub fn progress(&self) -> Option<(usize, usize)> {
        match &*self.lock() {
            SchemaState::Downloading { buf, total } => Some((buf.len(), *total)),
            _ => None,
        }
    }

    pub fn blob(&self) -> Option<String> {
        match &*self.lock() {
            SchemaState::Ready { blob } => Some(blob.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchemaState> {
        // a poisoned schema mutex means a panicking reader; the data is
        // still consistent, keep going
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for SharedSchema {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    SerialSending,
    SerialWaiting,
    JsonInitSending,
    JsonInitWaiting,
    JsonSegmentSending,
    JsonSegmentWaiting,
    Error,
}

/// Side effects the gateway has to apply after driving the machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnEffect {
    /// All four serial parts acquired for the current node.
    SerialAcquired([u32; 4]),
    /// Schema blob downloaded and parsed; persist it under this word.
    SchemaReady { word0: u32 },
}

#[derive(Clone, Copy, Debug)]
pub struct ConnTimeouts {
    pub per_request_ms: u64,
    pub serial_total_ms: u64,
    pub json_total_ms: u64,
}

impl Default for ConnTimeouts {
    fn default() -> Self {
        ConnTimeouts {
            per_request_ms: 100,
            serial_total_ms: 5_000,
            json_total_ms: 5_000,
        }
    }
}

pub struct DeviceConnection {
    state: ConnState,
    node: NodeId,
    serial: [u32; 4],
    part: usize,
    toggle: bool,
    retries: u32,
    state_since_ms: u64,
    op_started_ms: u64,
    schema: SharedSchema,
    json_total: usize,
    segments_rx: u32,
    client: u32,
    request_id: u32,
    timeouts: ConnTimeouts,
}

/// Emit a progress event every this many segments (plus start and end).
const PROGRESS_STRIDE: u32 = 32;

impl DeviceConnection {
    pub fn new(timeouts: ConnTimeouts) -> Self {
        DeviceConnection {
            state: ConnState::Idle,
            node: 0,
            serial: [0; 4],
            part: 0,
            toggle: false,
            retries: 0,
            state_since_ms: 0,
            op_started_ms: 0,
            schema: SharedSchema::new(),
            json_total: 0,
            segments_rx: 0,
            client: 0,
            request_id: 0,
            timeouts,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn serial(&self) -> [u32; 4] {
        self.serial
    }

    pub fn schema(&self) -> &SharedSchema {
        &self.schema
    }

    /// No operation in flight. Error counts as idle: a new connect attempt
    /// is the way out of it.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ConnState::Idle | ConnState::Error)
    }

    /// Begin serial acquisition against `node`. Selecting a different node
    /// drops the cached schema.
    pub fn start_serial(
        &mut self,
        node: NodeId,
        client: u32,
        request_id: u32,
        now_ms: u64,
    ) -> Result<(), GatewayError> {
        if !self.is_idle() {
            return Err(GatewayError::BadState(
                "connection busy with another transfer".into(),
            ));
        }
        if node == 0 || node > crate::NODE_ID_MAX {
            return Err(GatewayError::Parse(format!("node id {node} out of range")));
        }
        if node != self.node {
            self.schema.clear();
        }
        self.node = node;
        self.serial = [0; 4];
        self.part = 0;
        self.retries = 0;
        self.client = client;
        self.request_id = request_id;
        self.op_started_ms = now_ms;
        self.state_since_ms = now_ms;
        self.state = ConnState::SerialSending;
        Ok(())
    }

    /// Begin the schema download for the currently selected node.
    pub fn start_json(
        &mut self,
        client: u32,
        request_id: u32,
        now_ms: u64,
    ) -> Result<(), GatewayError> {
        if !self.is_idle() {
            return Err(GatewayError::BadState(
                "connection busy with another transfer".into(),
            ));
        }
        if self.node == 0 {
            return Err(GatewayError::BadState("no device selected".into()));
        }
        self.schema.clear();
        self.json_total = 0;
        self.segments_rx = 0;
        self.toggle = false;
        self.client = client;
        self.request_id = request_id;
        self.op_started_ms = now_ms;
        self.state_since_ms = now_ms;
        self.state = ConnState::JsonInitSending;
        Ok(())
    }

    /// Abandon whatever is in flight. In-flight responses will be dropped as
    /// unmatched.
    pub fn cancel(&mut self, pending: &mut PendingTable) {
        pending.clear_consumer(Consumer::Connection);
        if matches!(
            self.state,
            ConnState::JsonSegmentSending | ConnState::JsonSegmentWaiting
        ) {
            self.schema.clear();
        }
        self.state = ConnState::Idle;
    }

    fn fail(&mut self, pending: &mut PendingTable, events: &EventSink, err: &GatewayError) {
        log::warn!(
            "connection to node {} failed after {} retries: {err}",
            self.node,
            self.retries
        );
        pending.clear_consumer(Consumer::Connection);
        self.schema.clear();
        self.state = ConnState::Error;
        events.reply(
            self.client,
            self.request_id,
            Event::Error {
                kind: err.kind().to_owned(),
                message: err.to_string(),
            },
        );
        events.emit(Event::Disconnected { node_id: self.node });
    }

    /// Drive the machine one tick.
    pub fn process(
        &mut self,
        bus: &mut dyn CanBus,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) {
        match self.state {
            ConnState::Idle | ConnState::Error => {}

            ConnState::SerialSending => {
                let frame = sdo::upload_request(self.node, INDEX_SERIAL, self.part as u8);
                if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
                    pending.register(
                        PendingKey {
                            node: self.node,
                            index: INDEX_SERIAL,
                            sub: self.part as u8,
                        },
                        Consumer::Connection,
                    );
                    self.state = ConnState::SerialWaiting;
                    self.state_since_ms = now_ms;
                }
                // Busy: retry next tick, the global deadline still runs
                self.check_global(pending, events, now_ms, self.timeouts.serial_total_ms);
            }

            ConnState::SerialWaiting => {
                if now_ms.saturating_sub(self.state_since_ms) >= self.timeouts.per_request_ms {
                    self.retries += 1;
                    self.state = ConnState::SerialSending;
                }
                self.check_global(pending, events, now_ms, self.timeouts.serial_total_ms);
            }

            ConnState::JsonInitSending => {
                let frame = sdo::upload_request(self.node, INDEX_STRINGS, 0);
                if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
                    pending.register(
                        PendingKey {
                            node: self.node,
                            index: INDEX_STRINGS,
                            sub: 0,
                        },
                        Consumer::Connection,
                    );
                    self.state = ConnState::JsonInitWaiting;
                    self.state_since_ms = now_ms;
                }
                self.check_global(pending, events, now_ms, self.timeouts.json_total_ms);
            }

            ConnState::JsonInitWaiting => {
                if now_ms.saturating_sub(self.state_since_ms) >= self.timeouts.per_request_ms {
                    self.retries += 1;
                    self.state = ConnState::JsonInitSending;
                }
                self.check_global(pending, events, now_ms, self.timeouts.json_total_ms);
            }

            ConnState::JsonSegmentSending => {
                let frame = sdo::segment_request(self.node, self.toggle);
                if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
                    self.state = ConnState::JsonSegmentWaiting;
                    self.state_since_ms = now_ms;
                }
                self.check_global(pending, events, now_ms, self.timeouts.json_total_ms);
            }

            ConnState::JsonSegmentWaiting => {
                if now_ms.saturating_sub(self.state_since_ms) >= self.timeouts.per_request_ms {
                    // resend the same toggle; a duplicate answer is ignored
                    self.retries += 1;
                    self.state = ConnState::JsonSegmentSending;
                }
                self.check_global(pending, events, now_ms, self.timeouts.json_total_ms);
            }
        }
    }

    fn check_global(
        &mut self,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
        budget_ms: u64,
    ) {
        if now_ms.saturating_sub(self.op_started_ms) >= budget_ms {
            self.fail(pending, events, &GatewayError::Timeout);
        }
    }

    /// Deliver a routed SDO response. Returns an effect for the gateway to
    /// apply (persisting, directory updates).
    pub fn on_sdo_response(
        &mut self,
        response: &SdoResponse,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) -> Option<ConnEffect> {
        if let Some(kind) = response.abort_kind() {
            self.fail(pending, events, &GatewayError::Abort(kind));
            return None;
        }
        match self.state {
            ConnState::SerialWaiting => self.on_serial_part(response, pending, events, now_ms),
            ConnState::JsonInitWaiting => self.on_json_initiate(response, pending, events, now_ms),
            ConnState::JsonSegmentWaiting => self.on_json_segment(response, pending, events, now_ms),
            _ => {
                log::debug!("late connection response dropped in state {:?}", self.state);
                None
            }
        }
    }

    fn on_serial_part(
        &mut self,
        response: &SdoResponse,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) -> Option<ConnEffect> {
        // stricter than the field units: a serial part must be expedited
        let value = match response {
            SdoResponse::UploadInitiate { payload, .. } => payload.as_u32(),
            _ => None,
        };
        let Some(value) = value else {
            self.fail(pending, events, &GatewayError::Abort(AbortKind::Generic));
            return None;
        };
        self.serial[self.part] = value;
        self.part += 1;
        if self.part < 4 {
            self.state = ConnState::SerialSending;
            self.state_since_ms = now_ms;
            return None;
        }
        self.state = ConnState::Idle;
        events.reply(
            self.client,
            self.request_id,
            Event::Connected {
                node_id: self.node,
                serial: serial_string(&self.serial),
            },
        );
        Some(ConnEffect::SerialAcquired(self.serial))
    }

    fn on_json_initiate(
        &mut self,
        response: &SdoResponse,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) -> Option<ConnEffect> {
        let SdoResponse::UploadInitiate { payload, .. } = response else {
            self.fail(pending, events, &GatewayError::Abort(AbortKind::Generic));
            return None;
        };
        match payload {
            UploadPayload::Segmented { size } => {
                self.json_total = size.unwrap_or(0) as usize;
                self.schema.begin(self.json_total);
                events.reply(
                    self.client,
                    self.request_id,
                    Event::JsonProgress {
                        bytes: 0,
                        total: self.json_total,
                    },
                );
                self.toggle = false;
                pending.claim_segments(self.node, Consumer::Connection);
                self.state = ConnState::JsonSegmentSending;
                self.state_since_ms = now_ms;
                None
            }
            UploadPayload::Expedited { data, len } => {
                // a schema short enough to be expedited is degenerate but legal
                self.schema.begin(*len as usize);
                self.schema.append(&data[..*len as usize]);
                self.complete_json(pending, events)
            }
        }
    }

    fn on_json_segment(
        &mut self,
        response: &SdoResponse,
        pending: &mut PendingTable,
        events: &EventSink,
        now_ms: u64,
    ) -> Option<ConnEffect> {
        let SdoResponse::Segment(segment) = response else {
            self.fail(pending, events, &GatewayError::Abort(AbortKind::Generic));
            return None;
        };
        if segment.toggle != self.toggle {
            // duplicate of the previous segment after a resend; drop it
            log::debug!("toggle mismatch on schema segment, dropped");
            return None;
        }
        self.schema.append(&segment.data);
        self.segments_rx += 1;
        if segment.last {
            pending.release_segments();
            return self.complete_json(pending, events);
        }
        if self.segments_rx % PROGRESS_STRIDE == 0 {
            if let Some((bytes, total)) = self.schema.progress() {
                events.reply(self.client, self.request_id, Event::JsonProgress { bytes, total });
            }
        }
        self.toggle = !self.toggle;
        self.state = ConnState::JsonSegmentSending;
        self.state_since_ms = now_ms;
        None
    }

    fn complete_json(
        &mut self,
        pending: &mut PendingTable,
        events: &EventSink,
    ) -> Option<ConnEffect> {
        match self.schema.finish() {
            Ok(parsed) => {
                self.state = ConnState::Idle;
                events.reply(
                    self.client,
                    self.request_id,
                    Event::ParamSchemaData {
                        node_id: self.node,
                        schema: parsed,
                    },
                );
                Some(ConnEffect::SchemaReady {
                    word0: self.serial[0],
                })
            }
            Err(err) => {
                self.fail(pending, events, &err);
                None
            }
        }
    }
}
