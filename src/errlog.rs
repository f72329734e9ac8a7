//! Device error log enumeration: sub 0 of the error-number object holds the
//! count, entries 1..=n pair an error number with a device-side timestamp.

use std::time::Duration;

use serde::Serialize;

use crate::bus::{CanBus, TxStatus};
use crate::router::{Consumer, PendingKey, PendingTable, QueryStatus};
use crate::sdo::{self, SdoResponse, INDEX_ERROR_NUM, INDEX_ERROR_TIME};
use crate::{GatewayError, NodeId};

/// Devices keep a short ring of recent faults; cap the walk accordingly.
const MAX_ERRORS: u32 = 32;
const LIST_TIMEOUT_MS: u64 = 5_000;
const READ_TIMEOUT_MS: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceError {
    pub number: u32,
    /// Device uptime at the fault, milliseconds.
    pub time: u32,
}

enum Stage {
    Count,
    Number { i: u32 },
    Time { i: u32, number: u32 },
}

/// Cooperative error-log walk, one read per tick.
pub struct ErrorReader {
    node: NodeId,
    stage: Stage,
    count: u32,
    out: Vec<DeviceError>,
    waiting: bool,
    sent_ms: u64,
    started_ms: u64,
    pub client: u32,
    pub request_id: u32,
}

impl ErrorReader {
    pub fn new(node: NodeId, client: u32, request_id: u32, now_ms: u64) -> Self {
        ErrorReader {
            node,
            stage: Stage::Count,
            count: 0,
            out: Vec::new(),
            waiting: false,
            sent_ms: 0,
            started_ms: now_ms,
            client,
            request_id,
        }
    }

    fn current_read(&self) -> (u16, u8) {
        match self.stage {
            Stage::Count => (INDEX_ERROR_NUM, 0),
            Stage::Number { i } => (INDEX_ERROR_NUM, i as u8),
            Stage::Time { i, .. } => (INDEX_ERROR_TIME, i as u8),
        }
    }

    pub fn process(
        &mut self,
        bus: &mut dyn CanBus,
        pending: &mut PendingTable,
        now_ms: u64,
    ) -> QueryStatus<Vec<DeviceError>> {
        if now_ms.saturating_sub(self.started_ms) >= LIST_TIMEOUT_MS {
            pending.clear_consumer(Consumer::Query);
            return QueryStatus::Failed(GatewayError::Timeout);
        }
        if self.waiting {
            if now_ms.saturating_sub(self.sent_ms) >= READ_TIMEOUT_MS {
                self.waiting = false;
            } else {
                return QueryStatus::Running;
            }
        }
        let (index, sub) = self.current_read();
        let frame = sdo::upload_request(self.node, index, sub);
        if bus.transmit(&frame, Duration::ZERO) == TxStatus::Sent {
            pending.register(
                PendingKey {
                    node: self.node,
                    index,
                    sub,
                },
                Consumer::Query,
            );
            self.waiting = true;
            self.sent_ms = now_ms;
        }
        QueryStatus::Running
    }

    pub fn on_sdo_response(&mut self, response: &SdoResponse) -> QueryStatus<Vec<DeviceError>> {
        self.waiting = false;
        if let Some(kind) = response.abort_kind() {
            return QueryStatus::Failed(GatewayError::Abort(kind));
        }
        let value = match response {
            SdoResponse::UploadInitiate { payload, .. } => payload.as_u32(),
            _ => None,
        };
        let Some(value) = value else {
            return QueryStatus::Failed(GatewayError::Parse(
                "unexpected response shape in error list".into(),
            ));
        };
        match self.stage {
            Stage::Count => {
                self.count = value.min(MAX_ERRORS);
                if self.count == 0 {
                    return QueryStatus::Done(std::mem::take(&mut self.out));
                }
                self.stage = Stage::Number { i: 1 };
            }
            Stage::Number { i } => {
                self.stage = Stage::Time { i, number: value };
            }
            Stage::Time { i, number } => {
                self.out.push(DeviceError {
                    number,
                    time: value,
                });
                if i >= self.count {
                    return QueryStatus::Done(std::mem::take(&mut self.out));
                }
                self.stage = Stage::Number { i: i + 1 };
            }
        }
        QueryStatus::Running
    }
}
