//! Parameter identifiers and the Q27.5 wire format.
//!
//! Devices expose parameters by an opaque 16-bit unique id. On the wire a
//! value is a signed 32-bit fixed-point number with 5 fractional bits: the
//! device stores `round(value * 32)` and readers divide by 32.

use crate::sdo::INDEX_PARAM_UID;
use crate::NodeId;

/// Opaque 16-bit parameter identifier from the device schema.
pub type ParamId = u16;

/// Wire scale: 5 fractional bits.
const SCALE: f64 = 32.0;

/// Map a parameter id onto its object-dictionary address:
/// high byte selects the index page, low byte is the sub-index.
pub fn object_address(pid: ParamId) -> (u16, u8) {
    (INDEX_PARAM_UID | (pid >> 8), pid as u8)
}

/// Encode a value for an expedited write.
pub fn to_wire(value: f64) -> u32 {
    let clamped = (value * SCALE).round();
    // saturate instead of wrapping on absurd inputs; the device will abort
    // out-of-range values on its own terms anyway
    let fixed = if clamped >= i32::MAX as f64 {
        i32::MAX
    } else if clamped <= i32::MIN as f64 {
        i32::MIN
    } else {
        clamped as i32
    };
    fixed as u32
}

/// Decode an expedited read payload.
pub fn from_wire(raw: u32) -> f64 {
    (raw as i32) as f64 / SCALE
}

/// Upload request for a parameter by unique id.
pub fn upload_request(node: NodeId, pid: ParamId) -> crate::Frame {
    let (index, sub) = object_address(pid);
    crate::sdo::upload_request(node, index, sub)
}

/// Expedited download request for a parameter by unique id.
pub fn download_request(node: NodeId, pid: ParamId, value: f64) -> crate::Frame {
    let (index, sub) = object_address(pid);
    crate::sdo::download_request(node, index, sub, to_wire(value))
}
