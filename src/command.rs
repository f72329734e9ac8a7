//! Commands flowing clients -> gateway. The wire form is a tagged JSON
//! object: `{"action": "startScan", "requestId": 7, "start": 1, "end": 10}`.
//! The transport task parses lines with [`parse`] and pushes the result into
//! the bounded command queue.

use serde::Deserialize;

use crate::params::ParamId;
use crate::{GatewayError, NodeId};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    StartScan {
        start: NodeId,
        end: NodeId,
    },
    StopScan,
    Connect {
        node_id: NodeId,
        #[serde(default)]
        serial: Option<String>,
    },
    SetNodeId {
        id: NodeId,
    },
    StartSpotValues {
        param_ids: Vec<ParamId>,
        interval: u64,
    },
    StopSpotValues,
    SendCan {
        can_id: u16,
        data: Vec<u8>,
    },
    StartCanInterval {
        interval_id: String,
        can_id: u16,
        data: Vec<u8>,
        interval_ms: u64,
    },
    StopCanInterval {
        interval_id: String,
    },
    StartCanIoInterval {
        can_id: u16,
        pot: u16,
        pot2: u16,
        canio: u8,
        cruisespeed: u16,
        regenpreset: u8,
        interval_ms: u64,
        #[serde(default)]
        use_crc: bool,
    },
    UpdateCanIoFlags {
        pot: u16,
        pot2: u16,
        canio: u8,
        cruisespeed: u16,
        regenpreset: u8,
    },
    StopCanIoInterval,
    GetParamSchema {
        node_id: NodeId,
    },
    ReloadJson {
        node_id: NodeId,
    },
    GetParamValues {
        node_id: NodeId,
    },
    SetValue {
        param_id: ParamId,
        value: f64,
    },
    SaveToFlash,
    LoadFromFlash,
    LoadDefaults,
    Start {
        mode: u32,
    },
    Stop,
    Reset,
    ListErrors,
    GetCanMappings,
    AddCanMapping {
        is_rx: bool,
        can_id: u16,
        param_id: ParamId,
        offset_bits: u8,
        length_bits: u8,
        gain: f64,
    },
    RemoveCanMapping {
        index: u8,
        subindex: u8,
    },
    ClearCanMap {
        is_rx: bool,
    },
    FirmwareUpload {
        path: String,
    },
    GetDeviceList,
    RenameDevice {
        serial: String,
        name: String,
    },
    DeleteDevice {
        serial: String,
    },
    Ping,
}

/// A parsed command with its transport metadata.
#[derive(Clone, Debug)]
pub struct ClientCommand {
    pub client: u32,
    pub request_id: u32,
    pub command: Command,
}

/// Everything the gateway can pull off its input queue. Disconnects and
/// shutdown are transport-originated, never parsed off the wire.
#[derive(Clone, Debug)]
pub enum GatewayInput {
    Client(ClientCommand),
    ClientGone(u32),
    Shutdown,
}

#[derive(Deserialize)]
struct WireCommand {
    #[serde(default, rename = "requestId")]
    request_id: u32,
    #[serde(flatten)]
    command: Command,
}

/// Parse one wire line into a command. Structural failures surface as
/// [`GatewayError::Parse`] so the transport can answer with a correlated
/// error event.
pub fn parse(client: u32, line: &str) -> Result<ClientCommand, GatewayError> {
    let wire: WireCommand =
        serde_json::from_str(line).map_err(|e| GatewayError::Parse(e.to_string()))?;
    Ok(ClientCommand {
        client,
        request_id: wire.request_id,
        command: wire.command,
    })
}
