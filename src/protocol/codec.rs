use super::frame::tpkt::{Tpkt, TPKT_HEADER_LEN};
use super::frame::{Cotp, S7AppBody, S7Message, S7Pdu, WireDecode, WireEncode};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Codec for RFC 1006 framing over any byte stream: one TPKT frame in, one
/// [`S7Message`] out, and the reverse on encode.
#[derive(Debug, Default, Clone)]
pub struct Codec;

fn bad_frame(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl Decoder for Codec {
    type Item = S7Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<S7Message>, io::Error> {
        let total = match Tpkt::frame_len(src).map_err(bad_frame)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let frame = src.split_to(total).freeze();
        let tpkt = Tpkt::of_frame(&frame);

        // The COTP parser consumes exactly the TPDU header; whatever it
        // leaves over is the transport payload.
        let (rest, cotp) = Cotp::parse(&frame[TPKT_HEADER_LEN..], &frame).map_err(bad_frame)?;
        let body_at = frame.len() - rest.len();

        let app = match &cotp {
            Cotp::Dt(params) if body_at < frame.len() => {
                Some(classify_app(params.eot, frame.slice(body_at..), &frame))
            }
            _ => None,
        };
        Ok(Some(S7Message { tpkt, cotp, app }))
    }
}

/// Transport payload of a Data TPDU: a complete S7 PDU when this is the last
/// segment and it parses, otherwise raw bytes for session-level reassembly.
fn classify_app(eot: bool, body: Bytes, frame: &Bytes) -> S7AppBody {
    if !eot {
        return S7AppBody::Segment(body);
    }
    match S7Pdu::parse(&body, frame) {
        Ok((_rest, pdu)) => S7AppBody::Parsed(pdu),
        Err(_) => S7AppBody::Segment(body),
    }
}

impl Encoder<S7Message> for Codec {
    type Error = io::Error;

    fn encode(&mut self, item: S7Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        // Reserve the header slot, serialize the TPDU, backfill the length.
        let frame_start = dst.len();
        dst.put_bytes(0, TPKT_HEADER_LEN);
        item.cotp.encode_to(dst);
        if let (Cotp::Dt(_), Some(app)) = (&item.cotp, &item.app) {
            match app {
                S7AppBody::Segment(bytes) => dst.put_slice(bytes),
                S7AppBody::Parsed(pdu) => pdu.encode_to(dst),
            }
        }
        let payload_len = dst.len() - frame_start - TPKT_HEADER_LEN;
        let mut slot = &mut dst[frame_start..frame_start + TPKT_HEADER_LEN];
        Tpkt::for_payload(payload_len).write_to(&mut slot);
        Ok(())
    }
}
