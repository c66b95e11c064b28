use super::super::error::{Error, Result};
use super::types::{
    DataTransport, MemoryArea, ReturnCode, Transport, SYNTAX_ID_S7ANY, VAR_SPEC_ANY_LEN,
    VAR_SPEC_TYPE,
};
use bytes::BufMut;
use nom::number::complete::{be_u16, u8 as nom_u8};

/// One S7-ANY variable specification as carried in ReadVar/WriteVar
/// parameters. The 24-bit address field packs the byte address in the high
/// 21 bits and the bit address in the low 3 bits; Counter/Timer addresses are
/// raw indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSpec {
    pub transport: Transport,
    /// Number of elements
    pub count: u16,
    /// DB number if area is DB/IDB, else 0
    pub db: u16,
    pub area: MemoryArea,
    pub byte_offset: u32,
    /// Bit index 0..=7 for bit-level access
    pub bit_offset: u8,
}

impl VarSpec {
    pub fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(VAR_SPEC_TYPE);
        dst.put_u8(VAR_SPEC_ANY_LEN);
        dst.put_u8(SYNTAX_ID_S7ANY);
        dst.put_u8(self.transport as u8);
        dst.put_u16(self.count);
        dst.put_u16(self.db);
        dst.put_u8(self.area as u8);
        let addr: u32 = match self.transport {
            Transport::Counter | Transport::Timer => self.byte_offset,
            _ => (self.byte_offset << 3) | (self.bit_offset as u32 & 0x07),
        };
        dst.put_u8(((addr >> 16) & 0xFF) as u8);
        dst.put_u8(((addr >> 8) & 0xFF) as u8);
        dst.put_u8((addr & 0xFF) as u8);
    }

    pub fn parse(input: &[u8]) -> Result<(&[u8], VarSpec)> {
        let (i, spec_type) = take_u8(input)?;
        if spec_type != VAR_SPEC_TYPE {
            return Err(Error::unexpected("bad var spec marker"));
        }
        let (i, _len) = take_u8(i)?;
        let (i, syntax) = take_u8(i)?;
        if syntax != SYNTAX_ID_S7ANY {
            return Err(Error::unexpected("unsupported addressing syntax"));
        }
        let (i, transport_raw) = take_u8(i)?;
        let transport = Transport::try_from(transport_raw)
            .map_err(|_| Error::unexpected("unknown transport size"))?;
        let (i, count) = take_u16(i)?;
        let (i, db) = take_u16(i)?;
        let (i, area_raw) = take_u8(i)?;
        let area =
            MemoryArea::try_from(area_raw).map_err(|_| Error::unexpected("unknown area code"))?;
        if i.len() < 3 {
            return Err(Error::InsufficientData {
                needed: 3,
                available: i.len(),
            });
        }
        let addr = ((i[0] as u32) << 16) | ((i[1] as u32) << 8) | i[2] as u32;
        let (byte_offset, bit_offset) = match transport {
            Transport::Counter | Transport::Timer => (addr, 0),
            _ => (addr >> 3, (addr & 0x07) as u8),
        };
        Ok((
            &i[3..],
            VarSpec {
                transport,
                count,
                db,
                area,
                byte_offset,
                bit_offset,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VarSpecIter<'a> {
    remaining: &'a [u8],
    left: u8,
}

impl<'a> VarSpecIter<'a> {
    pub fn new(item_count: u8, raw: &'a [u8]) -> Self {
        Self {
            remaining: raw,
            left: item_count,
        }
    }
}

impl<'a> Iterator for VarSpecIter<'a> {
    type Item = Result<VarSpec>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        match VarSpec::parse(self.remaining) {
            Ok((rest, spec)) => {
                self.remaining = rest;
                self.left -= 1;
                Some(Ok(spec))
            }
            Err(e) => {
                self.left = 0;
                Some(Err(e))
            }
        }
    }
}

/// One data item of a read response or write request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataItemRef<'a> {
    pub return_code: ReturnCode,
    pub transport: DataTransport,
    pub data: &'a [u8],
}

/// Iterator over the data items of a ReadVar response (or WriteVar request)
/// payload. Handles the padding byte inserted between items when a payload
/// length is odd and another item follows.
#[derive(Debug, Clone, Copy)]
pub struct DataItemIter<'a> {
    remaining: &'a [u8],
    left: u8,
}

impl<'a> DataItemIter<'a> {
    pub fn new(item_count: u8, raw: &'a [u8]) -> Self {
        Self {
            remaining: raw,
            left: item_count,
        }
    }
}

impl<'a> Iterator for DataItemIter<'a> {
    type Item = Result<DataItemRef<'a>>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        let more_follow = self.left > 1;
        match parse_data_item(self.remaining) {
            Ok((mut rest, item)) => {
                if more_follow && (item.data.len() & 1) == 1 {
                    if rest.is_empty() {
                        self.left = 0;
                        return Some(Err(Error::unexpected("missing pad byte between items")));
                    }
                    rest = &rest[1..];
                }
                self.remaining = rest;
                self.left -= 1;
                Some(Ok(item))
            }
            Err(e) => {
                self.left = 0;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the per-item return codes of a WriteVar response payload.
#[derive(Debug, Clone, Copy)]
pub struct StatusItemIter<'a> {
    remaining: &'a [u8],
    left: u8,
}

impl<'a> StatusItemIter<'a> {
    pub fn new(item_count: u8, raw: &'a [u8]) -> Self {
        Self {
            remaining: raw,
            left: item_count,
        }
    }
}

impl<'a> Iterator for StatusItemIter<'a> {
    type Item = Result<ReturnCode>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        match self.remaining.split_first() {
            Some((&rc, rest)) => {
                self.remaining = rest;
                self.left -= 1;
                Some(Ok(ReturnCode::from(rc)))
            }
            None => {
                self.left = 0;
                Some(Err(Error::unexpected("short write response payload")))
            }
        }
    }
}

fn parse_data_item(input: &[u8]) -> Result<(&[u8], DataItemRef<'_>)> {
    let (i, rc) = take_u8(input)?;
    let (i, ts_raw) = take_u8(i)?;
    let transport =
        DataTransport::try_from(ts_raw).map_err(|_| Error::unexpected("unknown data transport"))?;
    let (i, len_field) = take_u16(i)?;
    let data_len = transport.len_field_to_bytes(len_field);
    if i.len() < data_len {
        return Err(Error::InsufficientData {
            needed: data_len,
            available: i.len(),
        });
    }
    let (data, rest) = i.split_at(data_len);
    Ok((
        rest,
        DataItemRef {
            return_code: ReturnCode::from(rc),
            transport,
            data,
        },
    ))
}

#[inline]
fn take_u8(input: &[u8]) -> Result<(&[u8], u8)> {
    nom_u8::<_, nom::error::Error<&[u8]>>(input)
        .map(|(rest, v)| (rest, v))
        .map_err(|_| Error::InsufficientData {
            needed: 1,
            available: input.len(),
        })
}

#[inline]
fn take_u16(input: &[u8]) -> Result<(&[u8], u16)> {
    be_u16::<_, nom::error::Error<&[u8]>>(input)
        .map(|(rest, v)| (rest, v))
        .map_err(|_| Error::InsufficientData {
            needed: 2,
            available: input.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn var_spec_round_trip() {
        let spec = VarSpec {
            transport: Transport::Byte,
            count: 16,
            db: 5,
            area: MemoryArea::Db,
            byte_offset: 40,
            bit_offset: 0,
        };
        let mut buf = BytesMut::new();
        spec.encode_to(&mut buf);
        assert_eq!(buf.len(), 12);
        // DBX40.3 address packing example: 40*8+3 = 0x000143
        let (rest, parsed) = VarSpec::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, spec);
    }

    #[test]
    fn var_spec_bit_address_packing() {
        let spec = VarSpec {
            transport: Transport::Bit,
            count: 1,
            db: 1,
            area: MemoryArea::Db,
            byte_offset: 40,
            bit_offset: 3,
        };
        let mut buf = BytesMut::new();
        spec.encode_to(&mut buf);
        assert_eq!(&buf[9..12], &[0x00, 0x01, 0x43]);
        let (_, parsed) = VarSpec::parse(&buf).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn timer_address_is_raw_index() {
        let spec = VarSpec {
            transport: Transport::Timer,
            count: 1,
            db: 0,
            area: MemoryArea::Timers,
            byte_offset: 5,
            bit_offset: 0,
        };
        let mut buf = BytesMut::new();
        spec.encode_to(&mut buf);
        assert_eq!(&buf[9..12], &[0x00, 0x00, 0x05]);
        let (_, parsed) = VarSpec::parse(&buf).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn data_items_with_padding() {
        // Two items: 3 data bytes (odd, padded) then 2 data bytes.
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u8(DataTransport::ByteWordDWord as u8);
        buf.put_u16(24); // 3 bytes in bits
        buf.put_slice(&[1, 2, 3]);
        buf.put_u8(0x00); // pad
        buf.put_u8(0xFF);
        buf.put_u8(DataTransport::ByteWordDWord as u8);
        buf.put_u16(16);
        buf.put_slice(&[4, 5]);

        let items: Vec<_> = DataItemIter::new(2, &buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].data, &[1, 2, 3]);
        assert_eq!(items[1].data, &[4, 5]);
    }

    #[test]
    fn data_item_length_in_bytes_for_real() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u8(DataTransport::Real as u8);
        buf.put_u16(4); // bytes, not bits
        buf.put_slice(&[0x42, 0x28, 0x00, 0x00]);
        let items: Vec<_> = DataItemIter::new(1, &buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(items[0].data.len(), 4);
    }
}
