//! Shared test harness: a scripted in-memory bus and a simulated SDO device,
//! so gateway ticks can be driven deterministically with a hand-cranked
//! clock.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use canbridge::bus::{BusConfig, BusFilter, CanBus, TxStatus};
use canbridge::error::{ABORT_OUT_OF_RANGE, ABORT_UNKNOWN_INDEX};
use canbridge::sdo::{
    INDEX_ERROR_NUM, INDEX_ERROR_TIME, INDEX_MAP_READ, INDEX_SERIAL, INDEX_STRINGS,
};
use canbridge::{Frame, GatewayError};

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame>>;

#[derive(Default)]
pub struct BusInner {
    pub rx: VecDeque<Frame>,
    pub sent: Vec<Frame>,
    pub tx_full: bool,
    pub filter: Option<BusFilter>,
    responder: Option<Responder>,
}

/// Clonable handle on a shared in-memory bus. Transmitted frames are logged
/// and offered to the registered responder; whatever it returns lands in the
/// RX queue, visible on the next `receive`.
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Rc<RefCell<BusInner>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_responder(&self, responder: Responder) {
        self.inner.borrow_mut().responder = Some(responder);
    }

    pub fn push_rx(&self, frame: Frame) {
        self.inner.borrow_mut().rx.push_back(frame);
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.inner.borrow().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.inner.borrow_mut().sent.clear();
    }

    pub fn set_tx_full(&self, full: bool) {
        self.inner.borrow_mut().tx_full = full;
    }

    pub fn filter(&self) -> Option<BusFilter> {
        self.inner.borrow().filter
    }
}

impl CanBus for MockBus {
    fn configure(&mut self, _config: &BusConfig) -> Result<(), GatewayError> {
        Ok(())
    }

    fn set_filter(&mut self, filter: BusFilter) -> Result<(), GatewayError> {
        self.inner.borrow_mut().filter = Some(filter);
        Ok(())
    }

    fn transmit(&mut self, frame: &Frame, _deadline: Duration) -> TxStatus {
        if self.inner.borrow().tx_full {
            return TxStatus::Busy;
        }
        self.inner.borrow_mut().sent.push(*frame);
        let mut responder = self.inner.borrow_mut().responder.take();
        if let Some(r) = &mut responder {
            let responses = r(frame);
            self.inner.borrow_mut().rx.extend(responses);
        }
        if responder.is_some() {
            self.inner.borrow_mut().responder = responder;
        }
        TxStatus::Sent
    }

    fn receive(&mut self, _deadline: Duration) -> Option<Frame> {
        self.inner.borrow_mut().rx.pop_front()
    }
}

/// A bare-bones SDO server standing in for one device on the bus.
pub struct SimDevice {
    pub node: u8,
    pub serial: [u32; 4],
    pub schema: String,
    pub params: HashMap<u16, u32>,
    /// Writes whose fixed-point magnitude exceeds this abort out-of-range.
    pub param_limit: i32,
    pub errors: Vec<(u32, u32)>,
    /// `(can_id, packed, gain, dir)` rows visible at the map read index.
    pub mappings: Vec<[u32; 4]>,
    /// In-flight segmented upload of the schema blob.
    upload: Option<UploadState>,
    /// Every write that got acked, for assertions.
    pub writes: Vec<(u16, u8, u32)>,
}

struct UploadState {
    data: Vec<u8>,
    pos: usize,
}

impl SimDevice {
    pub fn new(node: u8) -> Self {
        SimDevice {
            node,
            serial: [0x0000_0005, 0x3231_5110, 0x3430_3539, 0x3430_3539],
            schema: r#"{"curkp":{"id":258,"unit":"","value":0}}"#.to_owned(),
            params: HashMap::new(),
            param_limit: i32::MAX,
            errors: Vec::new(),
            mappings: Vec::new(),
            upload: None,
            writes: Vec::new(),
        }
    }

    fn expedited(&self, index: u16, sub: u8, value: u32) -> Frame {
        let mut data = [0u8; 8];
        data[0] = 0x43;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4..8].copy_from_slice(&value.to_le_bytes());
        Frame::new(0x580 | self.node as u16, &data).unwrap()
    }

    fn ack(&self, index: u16, sub: u8) -> Frame {
        let mut data = [0u8; 8];
        data[0] = 0x60;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        Frame::new(0x580 | self.node as u16, &data).unwrap()
    }

    fn abort(&self, index: u16, sub: u8, code: u32) -> Frame {
        let mut data = [0u8; 8];
        data[0] = 0x80;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4..8].copy_from_slice(&code.to_le_bytes());
        Frame::new(0x580 | self.node as u16, &data).unwrap()
    }

    fn segment(&mut self, toggle: bool) -> Frame {
        let Some(upload) = &mut self.upload else {
            return self.abort(INDEX_STRINGS, 0, ABORT_UNKNOWN_INDEX);
        };
        let remaining = upload.data.len() - upload.pos;
        let len = remaining.min(7);
        let last = remaining <= 7;
        let mut data = [0u8; 8];
        data[0] = ((toggle as u8) << 4) | (((7 - len) as u8) << 1) | last as u8;
        data[1..1 + len].copy_from_slice(&upload.data[upload.pos..upload.pos + len]);
        upload.pos += len;
        if last {
            self.upload = None;
        }
        Frame::new(0x580 | self.node as u16, &data).unwrap()
    }

    fn on_upload(&mut self, index: u16, sub: u8) -> Frame {
        match index {
            INDEX_SERIAL if (sub as usize) < 4 => {
                self.expedited(index, sub, self.serial[sub as usize])
            }
            INDEX_STRINGS if sub == 0 => {
                let data = self.schema.clone().into_bytes();
                let size = data.len() as u32;
                self.upload = Some(UploadState { data, pos: 0 });
                let mut frame_data = [0u8; 8];
                frame_data[0] = 0x41; // segmented, size follows
                frame_data[1..3].copy_from_slice(&index.to_le_bytes());
                frame_data[3] = sub;
                frame_data[4..8].copy_from_slice(&size.to_le_bytes());
                Frame::new(0x580 | self.node as u16, &frame_data).unwrap()
            }
            INDEX_ERROR_NUM if sub == 0 => self.expedited(index, sub, self.errors.len() as u32),
            INDEX_ERROR_NUM => match self.errors.get(sub as usize - 1) {
                Some(&(number, _)) => self.expedited(index, sub, number),
                None => self.abort(index, sub, ABORT_UNKNOWN_INDEX),
            },
            INDEX_ERROR_TIME => match self.errors.get(sub as usize - 1) {
                Some(&(_, time)) => self.expedited(index, sub, time),
                None => self.abort(index, sub, ABORT_UNKNOWN_INDEX),
            },
            i if (INDEX_MAP_READ..INDEX_MAP_READ + 64).contains(&i) => {
                let entry = (i - INDEX_MAP_READ) as usize;
                match self.mappings.get(entry) {
                    Some(row) if (sub as usize) < 4 => {
                        self.expedited(index, sub, row[sub as usize])
                    }
                    _ => self.abort(index, sub, ABORT_UNKNOWN_INDEX),
                }
            }
            i if i & 0xFF00 == 0x2100 => {
                let pid = ((i & 0xFF) << 8) | sub as u16;
                match self.params.get(&pid) {
                    Some(&raw) => self.expedited(index, sub, raw),
                    None => self.abort(index, sub, ABORT_UNKNOWN_INDEX),
                }
            }
            _ => self.abort(index, sub, ABORT_UNKNOWN_INDEX),
        }
    }

    fn on_download(&mut self, index: u16, sub: u8, value: u32) -> Frame {
        if index & 0xFF00 == 0x2100 {
            let magnitude = (value as i32).unsigned_abs();
            if magnitude > self.param_limit.unsigned_abs() {
                return self.abort(index, sub, ABORT_OUT_OF_RANGE);
            }
            let pid = ((index & 0xFF) << 8) | sub as u16;
            self.params.insert(pid, value);
        }
        self.writes.push((index, sub, value));
        self.ack(index, sub)
    }

    /// Responder entry point: react to one request frame.
    pub fn respond(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.id != 0x600 | self.node as u16 {
            return Vec::new();
        }
        let cmd = frame.data[0];
        let index = u16::from_le_bytes([frame.data[1], frame.data[2]]);
        let sub = frame.data[3];
        let response = match cmd & 0xE0 {
            0x40 => self.on_upload(index, sub),
            0x60 => self.segment(cmd & 0x10 != 0),
            0x20 => {
                let value =
                    u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
                self.on_download(index, sub, value)
            }
            _ => return Vec::new(),
        };
        vec![response]
    }

    /// Wrap into a MockBus responder.
    pub fn into_responder(self) -> (Rc<RefCell<SimDevice>>, Responder) {
        let dev = Rc::new(RefCell::new(self));
        let handle = dev.clone();
        let responder: Responder = Box::new(move |frame| handle.borrow_mut().respond(frame));
        (dev, responder)
    }
}

use canbridge::command::{ClientCommand, Command, GatewayInput};
use canbridge::event::{Event, EventSink, OutboundEvent};
use canbridge::store::DeviceStore;
use canbridge::{Gateway, GatewayConfig, ManualClock};
use crossbeam_channel::{Receiver, Sender};
use tempfile::TempDir;

/// A fully wired gateway over a mock bus and a hand-cranked clock. The
/// clock auto-steps 50 us per read so blocking waits always terminate.
pub struct Harness {
    pub gw: Gateway<MockBus, Rc<ManualClock>>,
    pub bus: MockBus,
    pub clock: Rc<ManualClock>,
    pub commands: Sender<GatewayInput>,
    pub events: Receiver<OutboundEvent>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let bus = MockBus::new();
        let clock = Rc::new(ManualClock::auto(50));
        let store = DeviceStore::open(dir.path()).unwrap();
        let (command_tx, command_rx) = crossbeam_channel::bounded(32);
        let (event_tx, event_rx) = crossbeam_channel::bounded(256);
        let gw = Gateway::new(
            bus.clone(),
            clock.clone(),
            store,
            GatewayConfig::default(),
            command_rx,
            EventSink::new(event_tx),
        );
        Harness {
            gw,
            bus,
            clock,
            commands: command_tx,
            events: event_rx,
            _dir: dir,
        }
    }

    pub fn with_device(device: SimDevice) -> (Self, Rc<RefCell<SimDevice>>) {
        let h = Self::new();
        let (handle, responder) = device.into_responder();
        h.bus.set_responder(responder);
        (h, handle)
    }

    pub fn send(&self, client: u32, request_id: u32, command: Command) {
        self.commands
            .send(GatewayInput::Client(ClientCommand {
                client,
                request_id,
                command,
            }))
            .unwrap();
    }

    /// Advance the clock and run ticks, `step_ms` per iteration.
    pub fn run_ms(&mut self, total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            self.clock.advance_ms(step_ms);
            elapsed += step_ms;
            self.gw.tick();
        }
    }

    pub fn tick(&mut self) {
        self.gw.tick();
    }

    /// Drain everything currently queued.
    pub fn drain_events(&self) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }

    /// Drain and keep only matching events.
    pub fn drain_where(&self, pred: impl Fn(&Event) -> bool) -> Vec<OutboundEvent> {
        self.drain_events()
            .into_iter()
            .filter(|o| pred(&o.event))
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
