use super::super::error::{Error, Result};
use super::comm::S7Header;
use super::r#ref::{parse_param, parse_payload, ParamRef, PayloadRef};
use super::wire::{WireDecode, WireEncode};
use bytes::{BufMut, Bytes, BytesMut};

/// Unified S7 PDU container: header plus raw parameter and data blocks held
/// as zero-copy slices of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu {
    pub header: S7Header,
    pub param: Bytes,
    pub data: Bytes,
}

impl S7Pdu {
    /// Check the AckData error class/code pair.
    pub fn check_error(&self) -> Result<()> {
        if let Some((class, code)) = self.header.error {
            if class != 0 || code != 0 {
                return Err(Error::Plc { class, code });
            }
        }
        Ok(())
    }

    /// Project the structured zero-copy view of parameter and data blocks.
    pub fn view(&self) -> Result<(ParamRef<'_>, PayloadRef<'_>)> {
        let param = parse_param(self.header.pdu_type, &self.param)?;
        let payload = parse_payload(&param, &self.data)?;
        Ok((param, payload))
    }

    /// Serialize into a fresh mutable buffer. The PDU reference can still be
    /// patched in place afterwards (see [`super::comm::PDU_REF_OFFSET`]).
    pub fn to_bytes_mut(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }
}

impl WireEncode for S7Pdu {
    fn encoded_len(&self) -> usize {
        self.header.len() + self.param.len() + self.data.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        self.header.encode_to(dst);
        if !self.param.is_empty() {
            dst.put_slice(&self.param);
        }
        if !self.data.is_empty() {
            dst.put_slice(&self.data);
        }
    }
}

impl WireDecode for S7Pdu {
    fn parse<'a>(input: &'a [u8], parent: &Bytes) -> Result<(&'a [u8], Self)> {
        let (header, rest) = S7Header::parse(input)?;
        let need = header.param_len as usize + header.data_len as usize;
        if rest.len() < need {
            return Err(Error::unexpected("length fields exceed buffer"));
        }
        let (param_bytes, tail) = rest.split_at(header.param_len as usize);
        let (data_bytes, remain) = tail.split_at(header.data_len as usize);
        Ok((
            remain,
            S7Pdu {
                header,
                param: Bytes::slice_ref(parent, param_bytes),
                data: Bytes::slice_ref(parent, data_bytes),
            },
        ))
    }
}
