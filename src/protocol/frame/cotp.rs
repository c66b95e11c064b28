use super::super::error::{Error, Result};
use super::cotp_param::{
    CotpConnParams, CotpDataParams, CotpDcParams, CotpDrParams, CotpReParams, CotpType,
};
use super::wire::{WireDecode, WireEncode};
use bytes::{BufMut, Bytes};

/// COTP TPDU (ISO 8073 subset carried over RFC 1006).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cotp {
    /// Connection Request
    Cr(CotpConnParams),
    /// Connection Confirm
    Cc(CotpConnParams),
    /// Disconnection Request
    Dr(CotpDrParams),
    /// Disconnection Confirm
    Dc(CotpDcParams),
    /// Reject
    Re(CotpReParams),
    /// Data TPDU
    Dt(CotpDataParams),
}

impl Cotp {
    fn type_code(&self) -> CotpType {
        match self {
            Cotp::Cr(_) => CotpType::Cr,
            Cotp::Cc(_) => CotpType::Cc,
            Cotp::Dr(_) => CotpType::Dr,
            Cotp::Dc(_) => CotpType::Dc,
            Cotp::Re(_) => CotpType::Re,
            Cotp::Dt(_) => CotpType::D,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.body_len(),
            Cotp::Dr(p) => p.body_len(),
            Cotp::Dc(p) => p.body_len(),
            Cotp::Re(p) => p.body_len(),
            Cotp::Dt(p) => p.body_len(),
        }
    }

    /// Negotiated TPDU size exponent if this TPDU carries one.
    pub fn tpdu_size(&self) -> Option<u8> {
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => Some(p.tpdu_size),
            _ => None,
        }
    }
}

impl WireEncode for Cotp {
    fn encoded_len(&self) -> usize {
        // LI byte + type byte + body
        2 + self.body_len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        // LI excludes itself
        dst.put_u8((1 + self.body_len()) as u8);
        dst.put_u8(self.type_code() as u8);
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.encode_body(dst),
            Cotp::Dr(p) => p.encode_body(dst),
            Cotp::Dc(p) => p.encode_body(dst),
            Cotp::Re(p) => p.encode_body(dst),
            Cotp::Dt(p) => p.encode_body(dst),
        }
    }
}

impl WireDecode for Cotp {
    /// Consume exactly the bytes covered by the COTP LI field (plus the LI
    /// byte itself). For Data, the user payload is whatever follows and is
    /// left in the returned rest slice.
    fn parse<'a>(input: &'a [u8], _parent: &Bytes) -> Result<(&'a [u8], Self)> {
        if input.len() < 2 {
            return Err(Error::InsufficientData {
                needed: 2,
                available: input.len(),
            });
        }
        let li = input[0] as usize;
        let total = 1 + li;
        if li < 1 || total > input.len() {
            return Err(Error::unexpected("invalid COTP length indicator"));
        }
        let tpdu_type: CotpType = input[1]
            .try_into()
            .map_err(|_| Error::unexpected("unknown COTP TPDU type"))?;
        let body = &input[2..total];
        let rest = &input[total..];
        let cotp = match tpdu_type {
            CotpType::Cr => Cotp::Cr(CotpConnParams::parse_body(body)?),
            CotpType::Cc => Cotp::Cc(CotpConnParams::parse_body(body)?),
            CotpType::Dr => Cotp::Dr(CotpDrParams::parse_body(body)?),
            CotpType::Dc => Cotp::Dc(CotpDcParams::parse_body(body)?),
            CotpType::Re => Cotp::Re(CotpReParams::parse_body(body)?),
            CotpType::D => Cotp::Dt(CotpDataParams::parse_body(body)?),
        };
        Ok((rest, cotp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn cr_round_trip() {
        let cr = Cotp::Cr(CotpConnParams {
            src_tsap: 0x0100,
            dst_tsap: 0x0142,
            ..Default::default()
        });
        let mut buf = BytesMut::new();
        cr.encode_to(&mut buf);
        assert_eq!(buf.len(), cr.encoded_len());
        let frozen = buf.freeze();
        let (rest, parsed) = Cotp::parse(&frozen, &frozen).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, cr);
    }

    #[test]
    fn dt_leaves_payload_in_rest() {
        let mut buf = BytesMut::new();
        Cotp::Dt(CotpDataParams::default()).encode_to(&mut buf);
        buf.extend_from_slice(&[0x32, 0x01]);
        let frozen = buf.freeze();
        let (rest, parsed) = Cotp::parse(&frozen, &frozen).unwrap();
        assert_eq!(rest, &[0x32, 0x01]);
        assert!(matches!(parsed, Cotp::Dt(p) if p.eot));
    }
}
