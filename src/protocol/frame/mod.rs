pub mod addr;
pub mod builder;
pub mod comm;
pub mod cotp;
pub mod cotp_param;
pub mod iter;
pub mod owned;
pub mod pdu;
pub mod r#ref;
pub mod tpkt;
pub mod tsap;
pub mod types;
pub mod wire;

use bytes::Bytes;

pub use addr::{parse_tag, ParsedTag, TagAddress, ValueKind};
pub use comm::S7Header;
pub use cotp::Cotp;
pub use cotp_param::{CotpConnParams, CotpDataParams};
pub use iter::{DataItemIter, DataItemRef, StatusItemIter, VarSpec, VarSpecIter};
pub use pdu::S7Pdu;
pub use r#ref::{
    parse_param, parse_payload, ParamRef, PayloadRef, SetupParam, UserDataParam,
    UserDataResponseHead,
};
pub use tpkt::Tpkt;
pub use wire::{WireDecode, WireEncode};

/// Application body carried by a COTP Data TPDU. Either a fully parsed S7 PDU
/// or a transport-level segment that still needs reassembly (COTP
/// end-of-transmission not set, or bytes the PDU parser rejected).
#[derive(Debug, Clone)]
pub enum S7AppBody {
    Segment(Bytes),
    Parsed(S7Pdu),
}

/// A fully decoded wire message: TPKT header, COTP TPDU and, for Data TPDUs,
/// the application body.
#[derive(Debug, Clone)]
pub struct S7Message {
    pub tpkt: Tpkt,
    pub cotp: Cotp,
    pub app: Option<S7AppBody>,
}

impl S7Message {
    /// Wrap an S7 payload in a COTP Data TPDU with end-of-transmission set.
    pub fn data(payload: Bytes) -> Self {
        S7Message {
            tpkt: Tpkt::for_payload(0),
            cotp: Cotp::Dt(CotpDataParams::default()),
            app: Some(S7AppBody::Segment(payload)),
        }
    }

    /// COTP Connection Request message.
    pub fn connection_request(src_tsap: u16, dst_tsap: u16) -> Self {
        S7Message {
            tpkt: Tpkt::for_payload(0),
            cotp: Cotp::Cr(CotpConnParams {
                src_tsap,
                dst_tsap,
                ..Default::default()
            }),
            app: None,
        }
    }

    /// COTP Connection Confirm message (test fixtures acting as the server).
    pub fn connection_confirm(src_tsap: u16, dst_tsap: u16) -> Self {
        S7Message {
            tpkt: Tpkt::for_payload(0),
            cotp: Cotp::Cc(CotpConnParams {
                src_tsap,
                dst_tsap,
                ..Default::default()
            }),
            app: None,
        }
    }
}
