use super::super::error::{Error, Result};
use bytes::BufMut;

/// Fixed size of the RFC 1006 TPKT header.
pub const TPKT_HEADER_LEN: usize = 4;

const TPKT_VERSION: u8 = 0x03;

/// TPKT (RFC 1006) header. Every wire frame starts with one: version,
/// a reserved byte, and the total frame length including the header itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tpkt {
    pub version: u8,
    pub reserved: u8,
    pub length: u16,
}

impl Tpkt {
    /// Header for a frame whose payload (COTP + S7 bytes) is `payload_len`.
    pub fn for_payload(payload_len: usize) -> Self {
        Self {
            version: TPKT_VERSION,
            reserved: 0x00,
            length: (TPKT_HEADER_LEN + payload_len).min(u16::MAX as usize) as u16,
        }
    }

    /// Inspect a receive buffer. Yields the total frame length once an
    /// entire frame is buffered, `None` while bytes are still missing, and
    /// an error for a header that can never frame a valid TPDU.
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        if buf[0] != TPKT_VERSION || buf[1] != 0x00 {
            return Err(Error::unexpected("not a TPKT header"));
        }
        let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total <= TPKT_HEADER_LEN {
            return Err(Error::unexpected("TPKT frame without payload"));
        }
        Ok(if buf.len() < total { None } else { Some(total) })
    }

    /// Rebuild the header fields from a complete frame accepted by
    /// [`Tpkt::frame_len`].
    pub fn of_frame(frame: &[u8]) -> Self {
        Tpkt {
            version: frame[0],
            reserved: frame[1],
            length: u16::from_be_bytes([frame[2], frame[3]]),
        }
    }

    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.version);
        dst.put_u8(self.reserved);
        dst.put_u16(self.length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn frame_len_waits_for_whole_frame() {
        // Header promises 9 bytes total.
        let frame = [0x03u8, 0x00, 0x00, 0x09, 1, 2, 3, 4, 5];
        assert_eq!(Tpkt::frame_len(&frame[..2]).unwrap(), None);
        assert_eq!(Tpkt::frame_len(&frame[..8]).unwrap(), None);
        assert_eq!(Tpkt::frame_len(&frame).unwrap(), Some(9));
        // Trailing bytes of a following frame don't confuse it.
        let mut longer = frame.to_vec();
        longer.extend_from_slice(&[0x03, 0x00]);
        assert_eq!(Tpkt::frame_len(&longer).unwrap(), Some(9));
    }

    #[test]
    fn frame_len_rejects_bad_headers() {
        assert!(Tpkt::frame_len(&[0x02, 0x00, 0x00, 0x08]).is_err());
        assert!(Tpkt::frame_len(&[0x03, 0x01, 0x00, 0x08]).is_err());
        // A frame that is all header can never carry a TPDU.
        assert!(Tpkt::frame_len(&[0x03, 0x00, 0x00, 0x04]).is_err());
    }

    #[test]
    fn header_write_and_reread_agree() {
        let hdr = Tpkt::for_payload(5);
        assert_eq!(hdr.length, 9);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);
        assert_eq!(buf.len(), TPKT_HEADER_LEN);
        assert_eq!(Tpkt::of_frame(&buf), hdr);
    }
}
