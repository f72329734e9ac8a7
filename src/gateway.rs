//! The gateway task: one cooperative loop that owns the bus, the SDO client
//! state machines and every periodic worker, fed by a bounded command queue
//! and draining into a bounded event queue.

use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::bus::{CanBus, TxStatus};
use crate::canio::{CanIo, CanIoFlags};
use crate::client::SdoLink;
use crate::clock::Clock;
use crate::command::{ClientCommand, Command, GatewayInput};
use crate::connection::{ConnEffect, ConnTimeouts, DeviceConnection};
use crate::discovery::{DiscoEffect, Discovery};
use crate::errlog::ErrorReader;
use crate::event::{Event, EventSink};
use crate::interval::IntervalManager;
use crate::lock::ClientLocks;
use crate::mapping::{self, CanMapping, MapReader};
use crate::params;
use crate::router::{self, Consumer, PendingKey, PendingTable, QueryStatus, RxClass};
use crate::sdo::{self, SdoResponse, CMD_DEFAULTS, CMD_LOAD, CMD_RESET, CMD_SAVE, CMD_START, CMD_STOP, INDEX_COMMANDS, INDEX_NODE_ID};
use crate::spot::SpotValues;
use crate::store::DeviceStore;
use crate::update::FirmwareUpdate;
use crate::{parse_serial, serial_string, Frame, GatewayError, NodeId};

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Per-request SDO deadline.
    pub sdo_timeout: Duration,
    /// Deadline for device command acks (save, start, ...).
    pub command_ack_timeout: Duration,
    /// Commands drained per tick before bus work resumes.
    pub commands_per_tick: usize,
    /// Blocking receive at the idle end of a tick.
    pub idle_receive: Duration,
    /// Minimum spacing between parameter requests.
    pub min_request_interval_us: u64,
    pub conn_timeouts: ConnTimeouts,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            sdo_timeout: Duration::from_millis(100),
            command_ack_timeout: Duration::from_millis(200),
            commands_per_tick: 8,
            idle_receive: Duration::from_millis(10),
            min_request_interval_us: 500,
            conn_timeouts: ConnTimeouts::default(),
        }
    }
}

/// The multi-round-trip client query in flight, at most one at a time.
enum Query {
    Errors(ErrorReader),
    Mappings(MapReader),
}

/// The gateway value. Every subsystem is a field - no statics, no double
/// initialization, and tests can drive [`Gateway::tick`] directly.
pub struct Gateway<B: CanBus, C: Clock> {
    bus: B,
    clock: C,
    config: GatewayConfig,
    link: SdoLink,
    pending: PendingTable,
    conn: DeviceConnection,
    disco: Discovery,
    intervals: IntervalManager,
    canio: CanIo,
    spot: SpotValues,
    update: FirmwareUpdate,
    locks: ClientLocks,
    store: DeviceStore,
    query: Option<Query>,
    events: EventSink,
    commands: Receiver<GatewayInput>,
    running: bool,
}

impl<B: CanBus, C: Clock> Gateway<B, C> {
    pub fn new(
        bus: B,
        clock: C,
        store: DeviceStore,
        config: GatewayConfig,
        commands: Receiver<GatewayInput>,
        events: EventSink,
    ) -> Self {
        Gateway {
            link: SdoLink::new(config.min_request_interval_us),
            conn: DeviceConnection::new(config.conn_timeouts),
            bus,
            clock,
            config,
            pending: PendingTable::new(),
            disco: Discovery::new(),
            intervals: IntervalManager::new(),
            canio: CanIo::new(),
            spot: SpotValues::new(),
            update: FirmwareUpdate::new(),
            locks: ClientLocks::new(),
            store,
            query: None,
            events,
            commands,
            running: true,
        }
    }

    /// Run until shutdown or until the command queue disappears.
    pub fn run(&mut self) {
        log::info!("gateway loop starting");
        while self.running {
            self.tick();
        }
        log::info!("gateway loop stopped");
    }

    /// One cooperative iteration. Public so tests can single-step the loop
    /// against a scripted bus and a hand-cranked clock.
    pub fn tick(&mut self) {
        for _ in 0..self.config.commands_per_tick {
            match self.commands.try_recv() {
                Ok(input) => self.handle_input(input),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    self.running = false;
                    return;
                }
            }
        }

        while let Some(frame) = self.bus.receive(Duration::ZERO) {
            self.route_rx(frame);
        }

        let now_ms = self.clock.now_ms();
        self.conn
            .process(&mut self.bus, &mut self.pending, &self.events, now_ms);

        if self.conn.is_idle() && !self.update.is_active() {
            self.disco
                .process(&mut self.bus, &mut self.pending, &self.events, now_ms);
        }

        self.intervals.send_due(&mut self.bus, now_ms);
        self.canio.send_if_due(&mut self.bus, now_ms);

        self.spot.reload_if_due(&self.events, now_ms);
        let now_us = self.clock.now_us();
        self.spot
            .dispatch_one(&mut self.bus, &mut self.link, &mut self.pending, now_us);

        self.update.process(&mut self.bus, &self.events, now_ms);

        self.drive_query(now_ms);

        // idle wait doubles as the RX poll
        if let Some(frame) = self.bus.receive(self.config.idle_receive) {
            self.route_rx(frame);
        }
    }

    fn handle_input(&mut self, input: GatewayInput) {
        match input {
            GatewayInput::Client(cmd) => self.handle_command(cmd),
            GatewayInput::ClientGone(client) => {
                self.locks.release_client(client);
                if self.spot.is_active() && self.spot.owner() == client {
                    self.spot.stop(&mut self.pending, &self.events);
                }
            }
            GatewayInput::Shutdown => self.running = false,
        }
    }

    fn handle_command(&mut self, cmd: ClientCommand) {
        let ClientCommand {
            client,
            request_id,
            command,
        } = cmd;
        match self.dispatch(client, request_id, command) {
            Ok(Some(event)) => self.events.reply(client, request_id, event),
            Ok(None) => {} // a state machine will reply when it finishes
            Err(err) => {
                log::debug!("command from client {client} failed: {err}");
                self.events.reply(
                    client,
                    request_id,
                    Event::Error {
                        kind: err.kind().to_owned(),
                        message: err.to_string(),
                    },
                );
            }
        }
    }

    /// The device a mutating command addresses, with the lock check.
    fn locked_node(&self, client: u32) -> Result<NodeId, GatewayError> {
        let node = self.conn.node();
        if node == 0 {
            return Err(GatewayError::BadState("no device selected".into()));
        }
        if !self.locks.may_mutate(node, client) {
            return Err(GatewayError::Locked);
        }
        Ok(node)
    }

    fn device_command(
        &mut self,
        client: u32,
        sub: u8,
        value: u32,
    ) -> Result<Option<Event>, GatewayError> {
        let node = self.locked_node(client)?;
        self.link.write_and_wait(
            &mut self.bus,
            &self.clock,
            node,
            INDEX_COMMANDS,
            sub,
            value,
            self.config.command_ack_timeout,
        )?;
        Ok(Some(Event::Ack))
    }

    fn dispatch(
        &mut self,
        client: u32,
        request_id: u32,
        command: Command,
    ) -> Result<Option<Event>, GatewayError> {
        let now_ms = self.clock.now_ms();
        match command {
            Command::Ping => Ok(Some(Event::Pong)),

            Command::StartScan { start, end } => {
                if !self.conn.is_idle() || self.update.is_active() {
                    return Err(GatewayError::BadState(
                        "scan not allowed while a transfer is active".into(),
                    ));
                }
                if !self.pending.is_idle() {
                    return Err(GatewayError::Busy);
                }
                self.disco.start(&mut self.bus, &self.events, start, end)?;
                Ok(Some(Event::Ack))
            }

            Command::StopScan => {
                self.disco.stop(&mut self.pending);
                self.events.emit(Event::ScanProgress {
                    node: 0,
                    done: true,
                });
                Ok(Some(Event::Ack))
            }

            Command::Connect { node_id, serial: _ } => {
                if !self.locks.try_acquire(node_id, client) {
                    return Err(GatewayError::Locked);
                }
                self.disco.stop(&mut self.pending);
                self.conn.start_serial(node_id, client, request_id, now_ms)?;
                Ok(None)
            }

            Command::SetNodeId { id } => {
                if id == 0 || id > crate::NODE_ID_MAX {
                    return Err(GatewayError::Parse(format!("node id {id} out of range")));
                }
                let node = self.locked_node(client)?;
                self.link.write_and_wait(
                    &mut self.bus,
                    &self.clock,
                    node,
                    INDEX_NODE_ID,
                    0,
                    id as u32,
                    self.config.command_ack_timeout,
                )?;
                Ok(Some(Event::Ack))
            }

            Command::StartSpotValues {
                param_ids,
                interval,
            } => {
                let node = self.conn.node();
                if node == 0 {
                    return Err(GatewayError::BadState("no device selected".into()));
                }
                if self.spot.is_active() && self.spot.owner() != client {
                    return Err(GatewayError::BadState(
                        "spot values already streaming for another client".into(),
                    ));
                }
                self.spot
                    .start(node, client, param_ids, interval, &self.events, now_ms);
                Ok(None)
            }

            Command::StopSpotValues => {
                self.spot.stop(&mut self.pending, &self.events);
                Ok(Some(Event::Ack))
            }

            Command::SendCan { can_id, data } => {
                let frame = Frame::new(can_id, &data)?;
                match self.bus.transmit(&frame, Duration::ZERO) {
                    TxStatus::Sent => Ok(Some(Event::Ack)),
                    TxStatus::Busy | TxStatus::Timeout => Err(GatewayError::Busy),
                }
            }

            Command::StartCanInterval {
                interval_id,
                can_id,
                data,
                interval_ms,
            } => {
                let frame = Frame::new(can_id, &data)?;
                self.intervals.start(&interval_id, frame, interval_ms);
                Ok(Some(Event::Ack))
            }

            Command::StopCanInterval { interval_id } => {
                self.intervals.stop(&interval_id);
                Ok(Some(Event::Ack))
            }

            Command::StartCanIoInterval {
                can_id,
                pot,
                pot2,
                canio,
                cruisespeed,
                regenpreset,
                interval_ms,
                use_crc,
            } => {
                if can_id > 0x7FF {
                    return Err(GatewayError::Parse(format!("{can_id:#x} is not a valid id")));
                }
                let flags = CanIoFlags {
                    pot,
                    pot2,
                    canio,
                    cruisespeed,
                    regenpreset,
                };
                self.canio.start(can_id, flags, interval_ms, use_crc);
                Ok(Some(Event::Ack))
            }

            Command::UpdateCanIoFlags {
                pot,
                pot2,
                canio,
                cruisespeed,
                regenpreset,
            } => {
                // ignored while stopped, by contract
                self.canio.update_flags(CanIoFlags {
                    pot,
                    pot2,
                    canio,
                    cruisespeed,
                    regenpreset,
                });
                Ok(Some(Event::Ack))
            }

            Command::StopCanIoInterval => {
                self.canio.stop();
                Ok(Some(Event::Ack))
            }

            Command::GetParamSchema { node_id } => {
                if node_id != self.conn.node() || node_id == 0 {
                    return Err(GatewayError::BadState("connect to the device first".into()));
                }
                let word0 = self.conn.serial()[0];
                if !self.store.is_schema_dirty(word0) {
                    if let Some(blob) = self.conn.schema().blob() {
                        let parsed = serde_json::from_str(&blob)
                            .map_err(|e| GatewayError::Parse(e.to_string()))?;
                        return Ok(Some(Event::ParamSchemaData {
                            node_id,
                            schema: parsed,
                        }));
                    }
                }
                self.conn.start_json(client, request_id, now_ms)?;
                Ok(None)
            }

            Command::ReloadJson { node_id } => {
                if node_id == self.conn.node() && node_id != 0 {
                    self.conn.start_json(client, request_id, now_ms)?;
                    return Ok(None);
                }
                // not the connected device: mark the cache stale instead of
                // pretending the reload happened
                if let Some(entry) = self.store.find_by_node(node_id) {
                    if let Some(serial) = parse_serial(&entry.serial) {
                        self.store.mark_schema_dirty(serial[0]);
                    }
                }
                Ok(Some(Event::ReloadDeferred { node_id }))
            }

            Command::GetParamValues { node_id } => Ok(Some(Event::ParamValues {
                node_id,
                values: self.spot.latest(),
            })),

            Command::SetValue { param_id, value } => {
                let node = self.locked_node(client)?;
                let (index, sub) = params::object_address(param_id);
                let result = self.link.write_and_wait(
                    &mut self.bus,
                    &self.clock,
                    node,
                    index,
                    sub,
                    params::to_wire(value),
                    self.config.sdo_timeout,
                );
                let tag = match result {
                    Ok(()) => "ok".to_owned(),
                    Err(err) if err.is_recoverable() => err.kind().to_owned(),
                    Err(err) => return Err(err),
                };
                Ok(Some(Event::ValueSet {
                    result: tag,
                    param_id,
                    value,
                }))
            }

            Command::SaveToFlash => self.device_command(client, CMD_SAVE, 1),
            Command::LoadFromFlash => self.device_command(client, CMD_LOAD, 1),
            Command::LoadDefaults => self.device_command(client, CMD_DEFAULTS, 1),
            Command::Start { mode } => self.device_command(client, CMD_START, mode),
            Command::Stop => self.device_command(client, CMD_STOP, 1),
            Command::Reset => self.device_command(client, CMD_RESET, 1),

            Command::ListErrors => {
                let node = self.conn.node();
                if node == 0 {
                    return Err(GatewayError::BadState("no device selected".into()));
                }
                if self.query.is_some() {
                    return Err(GatewayError::Busy);
                }
                self.query = Some(Query::Errors(ErrorReader::new(
                    node, client, request_id, now_ms,
                )));
                Ok(None)
            }

            Command::GetCanMappings => {
                let node = self.conn.node();
                if node == 0 {
                    return Err(GatewayError::BadState("no device selected".into()));
                }
                if self.query.is_some() {
                    return Err(GatewayError::Busy);
                }
                self.query = Some(Query::Mappings(MapReader::new(
                    node, client, request_id, now_ms,
                )));
                Ok(None)
            }

            Command::AddCanMapping {
                is_rx,
                can_id,
                param_id,
                offset_bits,
                length_bits,
                gain,
            } => {
                let node = self.locked_node(client)?;
                let m = CanMapping {
                    is_rx,
                    can_id,
                    param_id,
                    offset_bits,
                    length_bits,
                    gain,
                };
                mapping::add(
                    &mut self.link,
                    &mut self.bus,
                    &self.clock,
                    node,
                    &m,
                    self.config.sdo_timeout,
                )?;
                Ok(Some(Event::Ack))
            }

            Command::RemoveCanMapping { index, subindex } => {
                let node = self.locked_node(client)?;
                mapping::remove(
                    &mut self.link,
                    &mut self.bus,
                    &self.clock,
                    node,
                    index,
                    subindex,
                    self.config.sdo_timeout,
                )?;
                Ok(Some(Event::Ack))
            }

            Command::ClearCanMap { is_rx } => {
                let node = self.locked_node(client)?;
                mapping::clear(
                    &mut self.link,
                    &mut self.bus,
                    &self.clock,
                    node,
                    is_rx,
                    self.config.sdo_timeout,
                )?;
                Ok(Some(Event::Ack))
            }

            Command::FirmwareUpload { path } => {
                let node = self.locked_node(client)?;
                let image = std::fs::read(&path)?;
                self.update.start(image, client, request_id, now_ms)?;
                // kick the device into its bootloader; it won't ack the
                // reset, so a timeout here is expected
                let _ = self.link.write_and_wait(
                    &mut self.bus,
                    &self.clock,
                    node,
                    INDEX_COMMANDS,
                    CMD_RESET,
                    1,
                    self.config.sdo_timeout,
                );
                Ok(None)
            }

            Command::GetDeviceList => Ok(Some(Event::DeviceList {
                devices: self.store.list(),
            })),

            Command::RenameDevice { serial, name } => {
                if self.store.rename(&serial, &name)? {
                    Ok(Some(Event::Ack))
                } else {
                    Err(GatewayError::BadState(format!("unknown device {serial}")))
                }
            }

            Command::DeleteDevice { serial } => {
                if self.store.delete(&serial)? {
                    Ok(Some(Event::Ack))
                } else {
                    Err(GatewayError::BadState(format!("unknown device {serial}")))
                }
            }
        }
    }

    fn route_rx(&mut self, frame: Frame) {
        let now_ms = self.clock.now_ms();
        match router::classify(&frame) {
            RxClass::Sdo { node } => {
                if self.disco.note_heartbeat(node, now_ms) {
                    self.store.touch_node(node, now_ms);
                }
                let response = match sdo::parse_response(&frame) {
                    Ok((_, response)) => response,
                    Err(e) => {
                        log::debug!("malformed SDO response dropped: {e}");
                        return;
                    }
                };
                self.deliver_sdo(node, response, now_ms);
            }
            RxClass::Bootloader => {
                self.update
                    .on_bootloader_frame(&frame, &mut self.bus, &self.events, now_ms);
            }
            RxClass::Other => {
                log::debug!("unclassified frame dropped: {frame:?}");
            }
        }
    }

    fn deliver_sdo(&mut self, node: NodeId, response: SdoResponse, now_ms: u64) {
        let hit = match &response {
            SdoResponse::Segment(_) => self.pending.segment_consumer(node).map(|c| (c, None)),
            SdoResponse::UploadInitiate { index, sub, .. }
            | SdoResponse::DownloadAck { index, sub }
            | SdoResponse::Abort { index, sub, .. } => {
                let key = PendingKey {
                    node,
                    index: *index,
                    sub: *sub,
                };
                let by_key = self.pending.take(key).map(|c| (c, Some(key)));
                if by_key.is_none() && matches!(response, SdoResponse::Abort { .. }) {
                    // an abort can kill a segmented transfer mid-flight
                    self.pending.segment_consumer(node).map(|c| (c, None))
                } else {
                    by_key
                }
            }
        };
        match hit {
            Some((Consumer::Connection, _)) => {
                if let Some(effect) = self.conn.on_sdo_response(
                    &response,
                    &mut self.pending,
                    &self.events,
                    now_ms,
                ) {
                    self.apply_conn_effect(effect, now_ms);
                }
            }
            Some((Consumer::Discovery, _)) => {
                if let Some(DiscoEffect::Discovered { node, serial }) =
                    self.disco.on_sdo_response(&response, &self.events, now_ms)
                {
                    if let Err(e) = self
                        .store
                        .add_or_update(&serial_string(&serial), node, now_ms)
                    {
                        log::error!("failed to persist discovered device: {e}");
                    }
                }
            }
            Some((Consumer::SpotValues, Some(key))) => {
                self.spot.on_sdo_response(key.index, key.sub, &response);
            }
            Some((Consumer::SpotValues, None)) => {
                log::debug!("segment routed to spot values dropped");
            }
            Some((Consumer::Query, _)) => self.deliver_query(&response),
            None => {
                log::debug!("unmatched SDO response from node {node} dropped");
            }
        }
    }

    fn apply_conn_effect(&mut self, effect: ConnEffect, now_ms: u64) {
        match effect {
            ConnEffect::SerialAcquired(serial) => {
                if let Err(e) =
                    self.store
                        .add_or_update(&serial_string(&serial), self.conn.node(), now_ms)
                {
                    log::error!("failed to persist connected device: {e}");
                }
            }
            ConnEffect::SchemaReady { word0 } => {
                if let Some(blob) = self.conn.schema().blob() {
                    if let Err(e) = self.store.save_schema(word0, &blob) {
                        log::error!("failed to persist schema blob: {e}");
                    }
                }
            }
        }
    }

    fn drive_query(&mut self, now_ms: u64) {
        let Some(query) = &mut self.query else { return };
        let outcome = match query {
            Query::Errors(reader) => {
                let (client, request_id) = (reader.client, reader.request_id);
                match reader.process(&mut self.bus, &mut self.pending, now_ms) {
                    QueryStatus::Running => None,
                    QueryStatus::Done(errors) => {
                        Some((client, request_id, Ok(Event::ErrorList { errors })))
                    }
                    QueryStatus::Failed(err) => Some((client, request_id, Err(err))),
                }
            }
            Query::Mappings(reader) => {
                let (client, request_id) = (reader.client, reader.request_id);
                match reader.process(&mut self.bus, &mut self.pending, now_ms) {
                    QueryStatus::Running => None,
                    QueryStatus::Done(mappings) => {
                        Some((client, request_id, Ok(Event::CanMappings { mappings })))
                    }
                    QueryStatus::Failed(err) => Some((client, request_id, Err(err))),
                }
            }
        };
        self.finish_query(outcome);
    }

    fn deliver_query(&mut self, response: &SdoResponse) {
        let Some(query) = &mut self.query else { return };
        let outcome = match query {
            Query::Errors(reader) => {
                let (client, request_id) = (reader.client, reader.request_id);
                match reader.on_sdo_response(response) {
                    QueryStatus::Running => None,
                    QueryStatus::Done(errors) => {
                        Some((client, request_id, Ok(Event::ErrorList { errors })))
                    }
                    QueryStatus::Failed(err) => Some((client, request_id, Err(err))),
                }
            }
            Query::Mappings(reader) => {
                let (client, request_id) = (reader.client, reader.request_id);
                match reader.on_sdo_response(response) {
                    QueryStatus::Running => None,
                    QueryStatus::Done(mappings) => {
                        Some((client, request_id, Ok(Event::CanMappings { mappings })))
                    }
                    QueryStatus::Failed(err) => Some((client, request_id, Err(err))),
                }
            }
        };
        self.finish_query(outcome);
    }

    #[allow(clippy::type_complexity)]
    fn finish_query(&mut self, outcome: Option<(u32, u32, Result<Event, GatewayError>)>) {
        let Some((client, request_id, result)) = outcome else {
            return;
        };
        self.query = None;
        match result {
            Ok(event) => self.events.reply(client, request_id, event),
            Err(err) => self.events.reply(
                client,
                request_id,
                Event::Error {
                    kind: err.kind().to_owned(),
                    message: err.to_string(),
                },
            ),
        }
    }

    // test and tooling access

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.conn
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}
