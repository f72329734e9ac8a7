//! The pure SDO codec: build request frames, classify response frames.
//! Single-device client flavor of CANopen - requests ride `0x600 | node`,
//! responses `0x580 | node`, and only the four command shapes this fleet
//! actually speaks are implemented (initiate upload, segmented upload,
//! expedited download, abort).

use crate::error::AbortKind;
use crate::{Frame, GatewayError, NodeId};

pub const COB_REQUEST_BASE: u16 = 0x600;
pub const COB_RESPONSE_BASE: u16 = 0x580;
pub const COB_RESPONSE_END: u16 = 0x5FF;

// Object dictionary map shared by every device in the fleet.
pub const INDEX_SERIAL: u16 = 0x5000;
pub const INDEX_STRINGS: u16 = 0x5001;
pub const INDEX_COMMANDS: u16 = 0x5002;
pub const INDEX_ERROR_NUM: u16 = 0x5003;
pub const INDEX_ERROR_TIME: u16 = 0x5004;
pub const INDEX_NODE_ID: u16 = 0x5005;
pub const INDEX_PARAM_UID: u16 = 0x2100;
pub const INDEX_MAP_TX: u16 = 0x3000;
pub const INDEX_MAP_RX: u16 = 0x3001;
pub const INDEX_MAP_READ: u16 = 0x3100;

// Command sub-indices under INDEX_COMMANDS.
pub const CMD_SAVE: u8 = 0;
pub const CMD_LOAD: u8 = 1;
pub const CMD_DEFAULTS: u8 = 2;
pub const CMD_START: u8 = 3;
pub const CMD_STOP: u8 = 4;
pub const CMD_RESET: u8 = 5;

/// True iff the id sits in the SDO response window.
pub fn is_response_id(id: u16) -> bool {
    (COB_RESPONSE_BASE..=COB_RESPONSE_END).contains(&id)
}

/// Node addressed by a response cob-id. Only meaningful when
/// [`is_response_id`] holds.
pub fn response_node(id: u16) -> NodeId {
    (id & 0x7F) as u8
}

fn request_frame(node: NodeId, data: [u8; 8]) -> Frame {
    Frame {
        id: COB_REQUEST_BASE | node as u16,
        dlc: 8,
        data,
    }
}

/// Initiate-upload request (READ): command byte `0x40`.
pub fn upload_request(node: NodeId, index: u16, sub: u8) -> Frame {
    let mut data = [0u8; 8];
    data[0] = 0x40;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    request_frame(node, data)
}

/// Expedited sized download request (WRITE) of a 32-bit value:
/// command byte `0x20 | expedited | sized` with all four bytes used.
pub fn download_request(node: NodeId, index: u16, sub: u8, value: u32) -> Frame {
    let mut data = [0u8; 8];
    data[0] = 0x23;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    data[4..8].copy_from_slice(&value.to_le_bytes());
    request_frame(node, data)
}

/// Next-segment request, toggle in bit 4 of the command byte.
pub fn segment_request(node: NodeId, toggle: bool) -> Frame {
    let mut data = [0u8; 8];
    data[0] = 0x60 | ((toggle as u8) << 4);
    request_frame(node, data)
}

/// Abort a transfer; 4-byte error code rides in data[4..8].
pub fn abort_request(node: NodeId, index: u16, sub: u8, code: u32) -> Frame {
    let mut data = [0u8; 8];
    data[0] = 0x80;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    data[4..8].copy_from_slice(&code.to_le_bytes());
    request_frame(node, data)
}

/// Payload of an upload-initiate response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadPayload {
    /// Up to 4 bytes delivered in the response itself.
    Expedited { data: [u8; 4], len: u8 },
    /// Data follows in segments; the total byte count may be announced.
    Segmented { size: Option<u32> },
}

impl UploadPayload {
    /// Expedited payload widened to `u32` (little-endian, zero padded).
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            UploadPayload::Expedited { data, .. } => Some(u32::from_le_bytes(*data)),
            UploadPayload::Segmented { .. } => None,
        }
    }
}

/// One upload segment. Payload length is encoded in the command byte as
/// `7 - ((cmd >> 1) & 0x7)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub toggle: bool,
    pub last: bool,
    pub data: Vec<u8>,
}

/// A classified SDO response frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    UploadInitiate {
        index: u16,
        sub: u8,
        payload: UploadPayload,
    },
    Segment(Segment),
    DownloadAck {
        index: u16,
        sub: u8,
    },
    Abort {
        index: u16,
        sub: u8,
        code: u32,
    },
}

impl SdoResponse {
    /// Does this response echo the given object address? Segments carry no
    /// address and never match here; they are routed by transfer ownership.
    pub fn echoes(&self, index: u16, sub: u8) -> bool {
        match self {
            SdoResponse::UploadInitiate { index: i, sub: s, .. }
            | SdoResponse::DownloadAck { index: i, sub: s }
            | SdoResponse::Abort { index: i, sub: s, .. } => *i == index && *s == sub,
            SdoResponse::Segment(_) => false,
        }
    }

    pub fn abort_kind(&self) -> Option<AbortKind> {
        match self {
            SdoResponse::Abort { code, .. } => Some(AbortKind::from_code(*code)),
            _ => None,
        }
    }
}

fn object_address(data: &[u8; 8]) -> (u16, u8) {
    (u16::from_le_bytes([data[1], data[2]]), data[3])
}

/// Classify a frame from the response window. Errors mean the frame is not a
/// structurally valid SDO response (wrong cob-id, short, unknown specifier).
pub fn parse_response(frame: &Frame) -> Result<(NodeId, SdoResponse), GatewayError> {
    if !is_response_id(frame.id) {
        return Err(GatewayError::Parse(format!(
            "{:#x} is not an SDO response cob-id",
            frame.id
        )));
    }
    if frame.dlc < 8 {
        return Err(GatewayError::Parse(format!(
            "short SDO response ({} bytes)",
            frame.dlc
        )));
    }
    let node = response_node(frame.id);
    let cmd = frame.data[0];
    let response = match cmd >> 5 {
        // upload segment: toggle<<4 | free<<1 | last
        0b000 => {
            let toggle = cmd & 0x10 != 0;
            let last = cmd & 0x01 != 0;
            let len = 7 - ((cmd >> 1) & 0x7) as usize;
            SdoResponse::Segment(Segment {
                toggle,
                last,
                data: frame.data[1..1 + len].to_vec(),
            })
        }
        // upload initiate: 0x4X
        0b010 => {
            let (index, sub) = object_address(&frame.data);
            let sized = cmd & 0x01 != 0;
            let expedited = cmd & 0x02 != 0;
            let payload = if expedited {
                let len = if sized { 4 - ((cmd >> 2) & 0x3) } else { 4 };
                let mut data = [0u8; 4];
                data[..len as usize].copy_from_slice(&frame.data[4..4 + len as usize]);
                UploadPayload::Expedited { data, len }
            } else {
                let size = sized
                    .then(|| u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]));
                UploadPayload::Segmented { size }
            };
            SdoResponse::UploadInitiate { index, sub, payload }
        }
        // download ack: 0x60
        0b011 => {
            let (index, sub) = object_address(&frame.data);
            SdoResponse::DownloadAck { index, sub }
        }
        // abort: 0x80
        0b100 => {
            let (index, sub) = object_address(&frame.data);
            let code =
                u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
            SdoResponse::Abort { index, sub, code }
        }
        other => {
            return Err(GatewayError::Parse(format!(
                "unknown SDO response specifier {other:#05b}"
            )))
        }
    };
    Ok((node, response))
}
