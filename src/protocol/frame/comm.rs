use super::super::error::{Error, Result};
use super::types::PduType;
use bytes::BufMut;

/// S7 PDU header. 10 bytes for Job/UserData, 12 for Ack/AckData where the
/// error class and error code bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    pub protocol_id: u8,
    pub pdu_type: PduType,
    /// Redundancy identification, echoed by the peer.
    pub redundancy_id: u16,
    pub pdu_ref: u16,
    pub param_len: u16,
    pub data_len: u16,
    /// (error class, error code) on Ack/AckData only.
    pub error: Option<(u8, u8)>,
}

/// S7 protocol identifier, first byte of every PDU.
pub const PROTOCOL_ID: u8 = 0x32;

/// Byte offset of the PDU reference inside a serialized header. The IO driver
/// patches the reference in place when a job is admitted to the window.
pub const PDU_REF_OFFSET: usize = 4;

impl S7Header {
    pub fn job(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            protocol_id: PROTOCOL_ID,
            pdu_type: PduType::Job,
            redundancy_id: 0,
            pdu_ref,
            param_len,
            data_len,
            error: None,
        }
    }

    pub fn user_data(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            pdu_type: PduType::UserData,
            ..Self::job(pdu_ref, param_len, data_len)
        }
    }

    pub fn ack_data(pdu_ref: u16, param_len: u16, data_len: u16, error: (u8, u8)) -> Self {
        Self {
            pdu_type: PduType::AckData,
            error: Some(error),
            ..Self::job(pdu_ref, param_len, data_len)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.error.is_some() {
            12
        } else {
            10
        }
    }

    pub fn parse(input: &[u8]) -> Result<(S7Header, &[u8])> {
        if input.len() < 10 {
            return Err(Error::InsufficientData {
                needed: 10,
                available: input.len(),
            });
        }
        if input[0] != PROTOCOL_ID {
            return Err(Error::unexpected("bad S7 protocol id"));
        }
        let pdu_type =
            PduType::try_from(input[1]).map_err(|_| Error::unexpected("unknown ROSCTR"))?;
        let redundancy_id = u16::from_be_bytes([input[2], input[3]]);
        let pdu_ref = u16::from_be_bytes([input[4], input[5]]);
        let param_len = u16::from_be_bytes([input[6], input[7]]);
        let data_len = u16::from_be_bytes([input[8], input[9]]);

        let mut rest = &input[10..];
        let error = match pdu_type {
            PduType::Ack | PduType::AckData => {
                if rest.len() < 2 {
                    return Err(Error::InsufficientData {
                        needed: 2,
                        available: rest.len(),
                    });
                }
                let pair = (rest[0], rest[1]);
                rest = &rest[2..];
                Some(pair)
            }
            _ => None,
        };
        Ok((
            S7Header {
                protocol_id: PROTOCOL_ID,
                pdu_type,
                redundancy_id,
                pdu_ref,
                param_len,
                data_len,
                error,
            },
            rest,
        ))
    }

    pub fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.protocol_id);
        dst.put_u8(self.pdu_type as u8);
        dst.put_u16(self.redundancy_id);
        dst.put_u16(self.pdu_ref);
        dst.put_u16(self.param_len);
        dst.put_u16(self.data_len);
        if matches!(self.pdu_type, PduType::Ack | PduType::AckData) {
            let (class, code) = self.error.unwrap_or((0, 0));
            dst.put_u8(class);
            dst.put_u8(code);
        }
    }
}
