//! Request/response composition over the raw codec: transmit, then wait for
//! the response that echoes the request's object address. Responses for other
//! addresses are dropped but keep the clock ticking, so a late answer to an
//! earlier request can never satisfy the wrong caller.

use std::time::Duration;

use crate::bus::{CanBus, TxStatus};
use crate::clock::Clock;
use crate::sdo::{self, SdoResponse, UploadPayload};
use crate::{Frame, GatewayError, NodeId};

/// Granularity of the blocking receive inside a wait loop. Short enough that
/// a tick never overstays its budget by much.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// The single SDO client endpoint. Owns the request rate limit; the bus and
/// clock stay with the gateway and are borrowed per call.
pub struct SdoLink {
    min_interval_us: u64,
    last_request_us: u64,
}

impl SdoLink {
    pub fn new(min_interval_us: u64) -> Self {
        SdoLink {
            min_interval_us,
            last_request_us: 0,
        }
    }

    /// Rate gate. `true` consumes the slot; `false` means the caller should
    /// come back later without side effects.
    fn claim_slot(&mut self, now_us: u64) -> bool {
        if now_us.saturating_sub(self.last_request_us) < self.min_interval_us
            && self.last_request_us != 0
        {
            return false;
        }
        self.last_request_us = now_us;
        true
    }

    /// Non-blocking transmit of a prebuilt request. `Busy` when the rate
    /// limit or the TX queue pushes back; nothing is consumed in that case.
    pub fn try_send(
        &mut self,
        bus: &mut dyn CanBus,
        frame: &Frame,
        now_us: u64,
    ) -> Result<(), GatewayError> {
        if !self.claim_slot(now_us) {
            return Err(GatewayError::Busy);
        }
        match bus.transmit(frame, Duration::ZERO) {
            TxStatus::Sent => Ok(()),
            TxStatus::Busy | TxStatus::Timeout => {
                // give the slot back so the retry isn't throttled
                self.last_request_us = 0;
                Err(GatewayError::Busy)
            }
        }
    }

    /// Expedited read: transmit an upload request and wait for the echoing
    /// response. Returns the raw 32-bit payload.
    pub fn read_and_wait(
        &mut self,
        bus: &mut dyn CanBus,
        clock: &dyn Clock,
        node: NodeId,
        index: u16,
        sub: u8,
        deadline: Duration,
    ) -> Result<u32, GatewayError> {
        let request = sdo::upload_request(node, index, sub);
        let response = self.transact(bus, clock, node, index, sub, &request, deadline)?;
        match response {
            SdoResponse::UploadInitiate { payload, .. } => match payload {
                UploadPayload::Expedited { .. } => Ok(payload.as_u32().unwrap_or(0)),
                UploadPayload::Segmented { .. } => Err(GatewayError::Parse(
                    "expected expedited payload, device offered segments".to_owned(),
                )),
            },
            other => Err(GatewayError::Parse(format!(
                "unexpected response to upload request: {other:?}"
            ))),
        }
    }

    /// Expedited write: transmit a sized download and wait for the ack.
    pub fn write_and_wait(
        &mut self,
        bus: &mut dyn CanBus,
        clock: &dyn Clock,
        node: NodeId,
        index: u16,
        sub: u8,
        value: u32,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let request = sdo::download_request(node, index, sub, value);
        match self.transact(bus, clock, node, index, sub, &request, deadline)? {
            SdoResponse::DownloadAck { .. } => Ok(()),
            other => Err(GatewayError::Parse(format!(
                "unexpected response to download request: {other:?}"
            ))),
        }
    }

    /// Shared transact path: clear pending RX, transmit, wait for the echo.
    fn transact(
        &mut self,
        bus: &mut dyn CanBus,
        clock: &dyn Clock,
        node: NodeId,
        index: u16,
        sub: u8,
        request: &Frame,
        deadline: Duration,
    ) -> Result<SdoResponse, GatewayError> {
        self.last_request_us = clock.now_us();
        while bus.receive(Duration::ZERO).is_some() {}
        match bus.transmit(request, WAIT_SLICE) {
            TxStatus::Sent => {}
            TxStatus::Busy => return Err(GatewayError::Busy),
            TxStatus::Timeout => return Err(GatewayError::Timeout),
        }
        bus.flush_tx();
        self.wait_for_echo(bus, clock, node, index, sub, deadline)
    }

    fn wait_for_echo(
        &mut self,
        bus: &mut dyn CanBus,
        clock: &dyn Clock,
        node: NodeId,
        index: u16,
        sub: u8,
        deadline: Duration,
    ) -> Result<SdoResponse, GatewayError> {
        let deadline_us = clock.now_us() + deadline.as_micros() as u64;
        loop {
            let remaining = deadline_us.saturating_sub(clock.now_us());
            if remaining == 0 {
                return Err(GatewayError::Timeout);
            }
            let slice = WAIT_SLICE.min(Duration::from_micros(remaining));
            let Some(frame) = bus.receive(slice) else {
                continue;
            };
            let Ok((rx_node, response)) = sdo::parse_response(&frame) else {
                log::debug!("dropping non-SDO frame while waiting: {frame:?}");
                continue;
            };
            if rx_node != node || !response.echoes(index, sub) {
                log::debug!("dropping unmatched SDO response: {frame:?}");
                continue;
            }
            if let Some(kind) = response.abort_kind() {
                return Err(GatewayError::Abort(kind));
            }
            return Ok(response);
        }
    }
}

impl Default for SdoLink {
    fn default() -> Self {
        // 500 us between parameter requests, per the device datasheet
        SdoLink::new(500)
    }
}
