//! The frame I/O layer: a queue-backed send/receive seam over the CAN
//! controller. The gateway is the only caller, so nothing here is shared or
//! locked; backends just have to honor the deadline semantics.

use std::time::Duration;

use socketcan::{CanFilter, EmbeddedFrame, Frame as _, Id, Socket, SocketOptions};

use crate::{BaudRate, Frame, GatewayError};

/// Outcome of a transmit attempt. A zero deadline makes `transmit`
/// non-blocking: a saturated TX queue reports `Busy` instead of waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Sent,
    Busy,
    Timeout,
}

/// Bus bring-up parameters. The pin pair only matters to controller-attached
/// backends; socketcan ignores it.
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub interface: String,
    pub baud: BaudRate,
    pub tx_pin: u8,
    pub rx_pin: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            interface: "can0".to_owned(),
            baud: BaudRate::default(),
            tx_pin: 0,
            rx_pin: 0,
        }
    }
}

/// Hardware RX filter. Discovery needs accept-all; a connected session can
/// narrow to the SDO response range to cut interrupt load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusFilter {
    AcceptAll,
    Match { id: u16, mask: u16 },
}

/// The controller seam. Both queues are bounded (>= 30 frames) in every
/// backend; reconfiguration is only legal while no SDO transaction is in
/// flight, which the gateway enforces.
pub trait CanBus {
    fn configure(&mut self, config: &BusConfig) -> Result<(), GatewayError>;

    fn set_filter(&mut self, filter: BusFilter) -> Result<(), GatewayError>;

    /// Queue a frame. Zero deadline: return `Busy` instead of blocking.
    fn transmit(&mut self, frame: &Frame, deadline: Duration) -> TxStatus;

    /// Next inbound frame, or `None` once the deadline passes.
    fn receive(&mut self, deadline: Duration) -> Option<Frame>;

    /// Push anything still queued out onto the wire.
    fn flush_tx(&mut self) {}

    /// Drain stale RX traffic until the bus has been quiet for a beat.
    /// Bounded, so a chattering bus cannot wedge the caller.
    fn clear_rx_until_quiet(&mut self) {
        for _ in 0..64 {
            if self.receive(Duration::from_millis(5)).is_none() {
                break;
            }
        }
    }
}

/// Linux socketcan backend. Bitrate changes go through `ip link`, not the
/// socket API, so `configure` only rebinds the interface.
pub struct SocketCanBus {
    socket: socketcan::CanSocket,
    interface: String,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self, GatewayError> {
        let socket = socketcan::CanSocket::open(interface)?;
        Ok(SocketCanBus {
            socket,
            interface: interface.to_owned(),
        })
    }

    fn to_can_frame(frame: &Frame) -> socketcan::CanFrame {
        let id = socketcan::StandardId::new(frame.id).expect("11-bit id checked at construction");
        // payload length already bounded by Frame::new
        socketcan::CanFrame::new(Id::Standard(id), frame.payload()).expect("dlc <= 8")
    }

    fn from_can_frame(frame: &socketcan::CanFrame) -> Option<Frame> {
        match frame.id() {
            Id::Standard(sid) => Frame::new(sid.as_raw(), frame.data()).ok(),
            // extended ids are not part of this protocol family
            Id::Extended(_) => None,
        }
    }
}

impl CanBus for SocketCanBus {
    fn configure(&mut self, config: &BusConfig) -> Result<(), GatewayError> {
        if config.baud != BaudRate::default() {
            log::warn!(
                "bitrate {} must be set on {} via `ip link`, ignoring",
                config.baud.bits_per_second(),
                config.interface
            );
        }
        self.socket = socketcan::CanSocket::open(&config.interface)?;
        self.interface = config.interface.clone();
        Ok(())
    }

    fn set_filter(&mut self, filter: BusFilter) -> Result<(), GatewayError> {
        let filters = match filter {
            BusFilter::AcceptAll => vec![CanFilter::new(0, 0)],
            BusFilter::Match { id, mask } => {
                vec![CanFilter::new(id as u32, mask as u32)]
            }
        };
        self.socket.set_filters(filters.as_slice())?;
        Ok(())
    }

    fn transmit(&mut self, frame: &Frame, deadline: Duration) -> TxStatus {
        let can_frame = Self::to_can_frame(frame);
        let result = if deadline.is_zero() {
            let _ = self.socket.set_nonblocking(true);
            let r = self.socket.write_frame(&can_frame);
            let _ = self.socket.set_nonblocking(false);
            r
        } else {
            if self.socket.set_write_timeout(deadline).is_err() {
                return TxStatus::Timeout;
            }
            self.socket.write_frame(&can_frame)
        };
        match result {
            Ok(()) => TxStatus::Sent,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => TxStatus::Busy,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => TxStatus::Timeout,
            Err(e) => {
                log::error!("can tx failed on {}: {e}", self.interface);
                TxStatus::Timeout
            }
        }
    }

    fn receive(&mut self, deadline: Duration) -> Option<Frame> {
        if deadline.is_zero() {
            let _ = self.socket.set_nonblocking(true);
            let r = self.socket.read_frame().ok();
            let _ = self.socket.set_nonblocking(false);
            return r.as_ref().and_then(Self::from_can_frame);
        }
        self.socket.set_read_timeout(deadline).ok()?;
        match self.socket.read_frame() {
            Ok(frame) => Self::from_can_frame(&frame),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) => {
                log::error!("can rx failed on {}: {e}", self.interface);
                None
            }
        }
    }
}
