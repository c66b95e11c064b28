use super::super::error::{Error, Result};
use bytes::BufMut;

/// COTP TPDU type codes (subset sufficient for ISO-on-TCP + S7).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotpType {
    /// Connection Request
    Cr = 0xE0,
    /// Connection Confirm
    Cc = 0xD0,
    /// Disconnection Request
    Dr = 0x80,
    /// Disconnection Confirm
    Dc = 0xC0,
    /// Reject
    Re = 0x70,
    /// Data
    D = 0xF0,
}

impl TryFrom<u8> for CotpType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, ()> {
        match v {
            0xE0 => Ok(CotpType::Cr),
            0xD0 => Ok(CotpType::Cc),
            0x80 => Ok(CotpType::Dr),
            0xC0 => Ok(CotpType::Dc),
            0x70 => Ok(CotpType::Re),
            0xF0 => Ok(CotpType::D),
            _ => Err(()),
        }
    }
}

/// COTP Connection Request / Connection Confirm parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CotpConnParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    /// Class/option byte; always 0x00 for class 0 over RFC 1006.
    pub class_option: u8,
    /// TPDU size exponent (2^n bytes, typically 0x0A = 1024)
    pub tpdu_size: u8,
    pub src_tsap: u16,
    pub dst_tsap: u16,
}

impl Default for CotpConnParams {
    fn default() -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref: 0x0001,
            class_option: 0x00,
            tpdu_size: 0x0A,
            src_tsap: 0x0100,
            dst_tsap: 0x0100,
        }
    }
}

impl CotpConnParams {
    /// Fixed part (5 bytes) plus three TLVs: size(3), src tsap(4), dst tsap(4).
    pub fn body_len(&self) -> usize {
        5 + 3 + 4 + 4
    }

    pub fn encode_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.class_option);
        write_tlv(dst, 0xC0, &[self.tpdu_size]);
        write_tlv(dst, 0xC1, &self.src_tsap.to_be_bytes());
        write_tlv(dst, 0xC2, &self.dst_tsap.to_be_bytes());
    }

    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::unexpected("short COTP CR/CC body"));
        }
        let dst_ref = u16::from_be_bytes([body[0], body[1]]);
        let src_ref = u16::from_be_bytes([body[2], body[3]]);
        let class_option = body[4];
        let (tpdu_size, src_tsap, dst_tsap) = parse_connection_params(&body[5..])?;
        Ok(CotpConnParams {
            dst_ref,
            src_ref,
            class_option,
            tpdu_size,
            src_tsap,
            dst_tsap,
        })
    }
}

/// COTP Disconnection Request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CotpDrParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    pub reason: u8,
}

impl CotpDrParams {
    pub fn body_len(&self) -> usize {
        5
    }

    pub fn encode_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.reason);
    }

    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::unexpected("short COTP DR body"));
        }
        Ok(CotpDrParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            src_ref: u16::from_be_bytes([body[2], body[3]]),
            reason: body[4],
        })
    }
}

/// COTP Disconnection Confirm parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CotpDcParams {
    pub dst_ref: u16,
    pub src_ref: u16,
}

impl CotpDcParams {
    pub fn body_len(&self) -> usize {
        4
    }

    pub fn encode_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
    }

    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::unexpected("short COTP DC body"));
        }
        Ok(CotpDcParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            src_ref: u16::from_be_bytes([body[2], body[3]]),
        })
    }
}

/// COTP Reject parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CotpReParams {
    pub dst_ref: u16,
    pub cause: u8,
}

impl CotpReParams {
    pub fn body_len(&self) -> usize {
        3
    }

    pub fn encode_body<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.dst_ref);
        dst.put_u8(self.cause);
    }

    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 3 {
            return Err(Error::unexpected("short COTP RE body"));
        }
        Ok(CotpReParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            cause: body[2],
        })
    }
}

/// COTP Data TPDU parameters: end-of-transmission flag and TPDU number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CotpDataParams {
    pub eot: bool,
    pub tpdu_nr: u8,
}

impl Default for CotpDataParams {
    fn default() -> Self {
        Self {
            eot: true,
            tpdu_nr: 0,
        }
    }
}

impl CotpDataParams {
    pub fn body_len(&self) -> usize {
        1
    }

    pub fn encode_body<B: BufMut>(&self, dst: &mut B) {
        let eot_nr = if self.eot {
            0x80 | self.tpdu_nr
        } else {
            self.tpdu_nr
        };
        dst.put_u8(eot_nr);
    }

    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::unexpected("short COTP DT body"));
        }
        Ok(CotpDataParams {
            eot: (body[0] & 0x80) != 0,
            tpdu_nr: body[0] & 0x7F,
        })
    }
}

/// Fixed overhead of a COTP Data TPDU header: LI(1) + type(1) + eot/nr(1).
pub const COTP_DT_HEADER_LEN: usize = 3;

#[inline]
fn write_tlv<B: BufMut>(dst: &mut B, code: u8, bytes: &[u8]) {
    dst.put_u8(code);
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

/// Parse CR/CC parameter TLVs in any order, skipping unknown codes.
fn parse_connection_params(data: &[u8]) -> Result<(u8, u16, u16)> {
    let mut pos = 0;
    let mut tpdu_size = None;
    let mut src_tsap = None;
    let mut dst_tsap = None;

    while pos + 2 <= data.len() {
        let code = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(Error::unexpected("truncated COTP parameter"));
        }
        match code {
            0xC0 if len == 1 => tpdu_size = Some(data[pos]),
            0xC1 if len == 2 => src_tsap = Some(u16::from_be_bytes([data[pos], data[pos + 1]])),
            0xC2 if len == 2 => dst_tsap = Some(u16::from_be_bytes([data[pos], data[pos + 1]])),
            _ => {}
        }
        pos += len;
    }

    match (tpdu_size, src_tsap, dst_tsap) {
        (Some(size), Some(src), Some(dst)) => Ok((size, src, dst)),
        _ => Err(Error::unexpected("missing COTP connection parameter")),
    }
}
