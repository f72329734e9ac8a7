//! The crate-wide error taxonomy. Every handler returns one of these; the
//! gateway converts them into correlated `error` events for the client that
//! asked, so the variants are the observable failure vocabulary of the whole
//! system.

use thiserror::Error;

/// What an SDO abort code means to us. Devices answer out-of-range writes,
/// unknown object indices and everything else with distinct codes; anything
/// we don't recognize collapses to `Generic`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortKind {
    OutOfRange,
    UnknownIndex,
    Generic,
}

/// Abort code for a value outside the object's range.
pub const ABORT_OUT_OF_RANGE: u32 = 0x0609_0030;
/// Abort code for an object that does not exist in the dictionary.
pub const ABORT_UNKNOWN_INDEX: u32 = 0x0602_0000;
/// Catch-all abort code.
pub const ABORT_GENERAL: u32 = 0x0800_0000;

impl AbortKind {
    pub fn from_code(code: u32) -> AbortKind {
        match code {
            ABORT_OUT_OF_RANGE => AbortKind::OutOfRange,
            ABORT_UNKNOWN_INDEX => AbortKind::UnknownIndex,
            _ => AbortKind::Generic,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            AbortKind::OutOfRange => ABORT_OUT_OF_RANGE,
            AbortKind::UnknownIndex => ABORT_UNKNOWN_INDEX,
            AbortKind::Generic => ABORT_GENERAL,
        }
    }
}

impl std::fmt::Display for AbortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortKind::OutOfRange => "value out of range",
            AbortKind::UnknownIndex => "unknown object index",
            AbortKind::Generic => "general device error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No matching response arrived within the deadline.
    #[error("timed out waiting for a response")]
    Timeout,

    /// The device answered with an SDO abort.
    #[error("SDO abort: {0}")]
    Abort(AbortKind),

    /// TX queue full or another transaction still owns the bus.
    #[error("bus busy")]
    Busy,

    /// A mutating command from a client that does not hold the device lock.
    #[error("device locked by another client")]
    Locked,

    /// Command is not valid in the current state.
    #[error("invalid in current state: {0}")]
    BadState(String),

    /// Inbound payload failed a structural check.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable driver/bus error. The gateway drops to a safe error
    /// state and the operator has to re-initialize.
    #[error("fatal bus error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Stable machine-readable tag used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Timeout => "timeout",
            GatewayError::Abort(AbortKind::OutOfRange) => "outOfRange",
            GatewayError::Abort(AbortKind::UnknownIndex) => "unknownIndex",
            GatewayError::Abort(AbortKind::Generic) => "commError",
            GatewayError::Busy => "busy",
            GatewayError::Locked => "locked",
            GatewayError::BadState(_) => "badState",
            GatewayError::Parse(_) => "parse",
            GatewayError::Io(_) => "io",
            GatewayError::Fatal(_) => "fatal",
        }
    }

    /// Recoverable errors are reported to the initiating client and change no
    /// global state. The rest are logged and may force a reset.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GatewayError::Fatal(_))
    }
}
