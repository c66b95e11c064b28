use super::frame::types::{header_error_description, ReturnCode};
use std::fmt;
use std::result::Result as StdResult;
use thiserror::Error as ThisError;

/// Unified result type for the whole crate.
pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed textual tag address.
    #[error("cannot parse address '{0}'")]
    ParseAddr(String),

    /// Bad call shape (argument counts, value kinds, out-of-range parameters).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation forbidden in the current connection state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Endpoint is not connected.
    #[error("not connected")]
    NotConnected,

    /// Transport connect or per-job deadline elapsed.
    #[error("timeout")]
    Timeout,

    /// In-flight job cancelled by connection teardown.
    #[error("interrupted by connection teardown")]
    Interrupted,

    /// A single write item exceeds the maximum payload of one PDU.
    #[error("item '{name}' too big for one PDU: {bytes} bytes, max {max}")]
    ItemTooBig {
        name: String,
        bytes: usize,
        max: usize,
    },

    /// PDU shape violates the codec's schema.
    #[error("unexpected response: {context}")]
    UnexpectedResponse { context: &'static str },

    /// Nonzero error class/code pair in an AckData header.
    #[error("PLC error class 0x{class:02X} code 0x{code:02X}")]
    Plc { class: u8, code: u8 },

    /// Per-item read/write failure reported by the controller.
    #[error("item returned {code:?}: {context}")]
    ReturnCode { code: ReturnCode, context: String },

    /// Input does not have enough bytes to complete a parse.
    #[error("insufficient data: needed {needed} bytes, available {available}")]
    InsufficientData { needed: usize, available: usize },
}

/// Stable kind tag for an [`Error`]. Kinds are what callers should match on
/// and what log pipelines key by; the message text is free to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseAddr,
    InvalidArgument,
    IllegalState,
    NotConnected,
    Timeout,
    Interrupted,
    ItemTooBig,
    UnexpectedResponse,
    PlcError,
    /// Per-item numeric return code; the code itself is the kind.
    ReturnCode(u8),
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ParseAddr => f.write_str("ERR_PARSE_ADDR"),
            ErrorKind::InvalidArgument => f.write_str("ERR_INVALID_ARGUMENT"),
            ErrorKind::IllegalState => f.write_str("ERR_ILLEGAL_STATE"),
            ErrorKind::NotConnected => f.write_str("ERR_NOT_CONNECTED"),
            ErrorKind::Timeout => f.write_str("ERR_TIMEOUT"),
            ErrorKind::Interrupted => f.write_str("ERR_INTERRUPTED"),
            ErrorKind::ItemTooBig => f.write_str("ERR_ITEM_TOO_BIG"),
            ErrorKind::UnexpectedResponse => f.write_str("ERR_UNEXPECTED_RESPONSE"),
            ErrorKind::PlcError => f.write_str("ERR_PLC_ERROR"),
            ErrorKind::ReturnCode(code) => write!(f, "0x{code:02X}"),
            ErrorKind::Io => f.write_str("ERR_IO"),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::ParseAddr(_) => ErrorKind::ParseAddr,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Timeout => ErrorKind::Timeout,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::ItemTooBig { .. } => ErrorKind::ItemTooBig,
            Error::UnexpectedResponse { .. } => ErrorKind::UnexpectedResponse,
            Error::Plc { .. } => ErrorKind::PlcError,
            Error::ReturnCode { code, .. } => ErrorKind::ReturnCode(u8::from(*code)),
            // Short or malformed buffers are a schema violation from the
            // caller's point of view.
            Error::InsufficientData { .. } => ErrorKind::UnexpectedResponse,
        }
    }

    /// Human-readable description for PLC-reported failures, from the
    /// constants table. Empty for all other kinds.
    pub fn plc_description(&self) -> &'static str {
        match self {
            Error::Plc { class, code } => header_error_description(*class, *code),
            Error::ReturnCode { code, .. } => code.description(),
            _ => "",
        }
    }

    pub(crate) fn unexpected(context: &'static str) -> Self {
        Error::UnexpectedResponse { context }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::NotConnected.kind().to_string(), "ERR_NOT_CONNECTED");
        assert_eq!(Error::Timeout.kind().to_string(), "ERR_TIMEOUT");
        let e = Error::ReturnCode {
            code: ReturnCode::InvalidAddress,
            context: "DB1 byte 0 len 4".into(),
        };
        assert_eq!(e.kind(), ErrorKind::ReturnCode(0x05));
        assert_eq!(e.kind().to_string(), "0x05");
    }

    #[test]
    fn insufficient_data_maps_to_unexpected_response() {
        let e = Error::InsufficientData {
            needed: 10,
            available: 3,
        };
        assert_eq!(e.kind(), ErrorKind::UnexpectedResponse);
    }
}
