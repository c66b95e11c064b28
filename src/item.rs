//! A typed PLC variable: parsed address, scratch buffer for grouped reads,
//! and the decode/encode paths between wire bytes and [`ItemValue`].

use crate::protocol::error::{Error, Result};
use crate::protocol::frame::iter::VarSpec;
use crate::protocol::frame::types::{
    bcd16_to_value, decode_datetime8, dec_to_bcd, encode_datetime8, latin1_bytes_to_string,
    s5time_from_duration, s5time_to_duration, Transport,
};
use crate::protocol::frame::{parse_tag, ParsedTag, ValueKind};
use crate::protocol::planner::{CopySpec, ReadSpan};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Duration as ChronoDuration, NaiveDateTime};

/// Decoded value of one tag. Arrays are homogeneous.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Bool(bool),
    Byte(u8),
    Char(char),
    Word(u16),
    Int(i16),
    DWord(u32),
    DInt(i32),
    Real(f32),
    String(String),
    /// TIMER (S5TIME) and TIME values.
    Duration(ChronoDuration),
    /// COUNTER values (BCD on the wire).
    Counter(u16),
    DateTime(NaiveDateTime),
    Array(Vec<ItemValue>),
}

/// One named variable owned by an item group.
#[derive(Debug, Clone)]
pub struct Item {
    name: String,
    tag: ParsedTag,
    buffer: BytesMut,
    value: ItemValue,
}

impl Item {
    pub fn new(name: impl Into<String>, address: &str) -> Result<Self> {
        let tag = parse_tag(address)?;
        let mut buffer = BytesMut::with_capacity(tag.byte_length);
        buffer.resize(tag.byte_length, 0);
        Ok(Item {
            name: name.into(),
            tag,
            buffer,
            value: ItemValue::Byte(0),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tag(&self) -> &ParsedTag {
        &self.tag
    }

    #[inline]
    pub fn value(&self) -> &ItemValue {
        &self.value
    }

    /// The planner input for this item: bit-addressed tags are promoted to
    /// their covering byte window and never split.
    pub fn read_span(&self) -> ReadSpan {
        let addr = &self.tag.address;
        ReadSpan {
            area: addr.area,
            db: addr.db,
            transport: self.tag.read_transport,
            start: addr.byte_offset,
            length: self.tag.byte_length,
            bit: addr.bit_offset,
            splittable: self.tag.kind != ValueKind::Bool,
        }
    }

    /// The request part for a one-item read.
    pub fn read_spec(&self) -> VarSpec {
        let addr = &self.tag.address;
        let count = match self.tag.read_transport {
            Transport::Counter | Transport::Timer => addr.count,
            _ => self.tag.byte_length as u16,
        };
        VarSpec {
            transport: self.tag.read_transport,
            count,
            db: addr.db,
            area: addr.area,
            byte_offset: addr.byte_offset,
            bit_offset: 0,
        }
    }

    /// The request spec for a write. Bit tags stay bit-granular.
    pub fn write_spec(&self) -> VarSpec {
        let addr = &self.tag.address;
        let count = match self.tag.write_transport {
            Transport::Bit => addr.count,
            Transport::Counter | Transport::Timer => addr.count,
            _ => self.tag.byte_length_with_fill as u16,
        };
        VarSpec {
            transport: self.tag.write_transport,
            count,
            db: addr.db,
            area: addr.area,
            byte_offset: addr.byte_offset,
            bit_offset: addr.bit_offset,
        }
    }

    /// Where this item's bytes live within a part window, or `None` when the
    /// window does not reach the item at all.
    pub fn copy_window(&self, part_start: u32, part_len: usize) -> Option<CopySpec> {
        let item_start = self.tag.address.byte_offset as usize;
        let item_end = item_start + self.tag.byte_length;
        let win_start = part_start as usize;
        let win_end = win_start + part_len;
        let start = item_start.max(win_start);
        let end = item_end.min(win_end);
        if start >= end {
            return None;
        }
        Some(CopySpec {
            source_offset: start - win_start,
            dest_offset: start - item_start,
            byte_count: end - start,
        })
    }

    /// Scatter a slice of a response window into the scratch buffer.
    pub fn copy_from_window(&mut self, window: &[u8], copy: &CopySpec) -> Result<()> {
        let src_end = copy.source_offset + copy.byte_count;
        let dst_end = copy.dest_offset + copy.byte_count;
        if src_end > window.len() {
            return Err(Error::unexpected("response window shorter than planned"));
        }
        if dst_end > self.buffer.len() {
            return Err(Error::unexpected("copy descriptor exceeds item buffer"));
        }
        self.buffer[copy.dest_offset..dst_end]
            .copy_from_slice(&window[copy.source_offset..src_end]);
        Ok(())
    }

    /// Decode the scratch buffer into the typed value.
    pub fn update_value_from_buffer(&mut self) -> Result<()> {
        self.value = decode_value(&self.tag, &self.buffer)?;
        Ok(())
    }

    /// Encode a value into a fresh write buffer sized by
    /// byte-length-with-fill.
    pub fn write_buffer(&self, value: &ItemValue) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.tag.byte_length_with_fill);
        encode_value(&self.tag, value, &mut buf)?;
        if buf.len() > self.tag.byte_length_with_fill {
            return Err(Error::InvalidArgument(format!(
                "value for '{}' encodes to {} bytes, tag holds {}",
                self.name,
                buf.len(),
                self.tag.byte_length_with_fill
            )));
        }
        buf.resize(self.tag.byte_length_with_fill, 0);
        Ok(buf.freeze())
    }
}

fn decode_value(tag: &ParsedTag, buf: &[u8]) -> Result<ItemValue> {
    let count = tag.address.count as usize;
    if tag.kind == ValueKind::String {
        return decode_string(tag, buf);
    }
    if tag.kind == ValueKind::Bool {
        return decode_bits(tag, buf);
    }

    let elem = tag.kind.element_bytes();
    if buf.len() < elem * count {
        return Err(Error::unexpected("item buffer shorter than value"));
    }
    if count == 1 {
        return decode_scalar(tag.kind, &buf[..elem]);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(decode_scalar(tag.kind, &buf[i * elem..(i + 1) * elem])?);
    }
    Ok(ItemValue::Array(out))
}

fn decode_scalar(kind: ValueKind, b: &[u8]) -> Result<ItemValue> {
    Ok(match kind {
        ValueKind::Byte => ItemValue::Byte(b[0]),
        ValueKind::Char => ItemValue::Char(b[0] as char),
        ValueKind::Word => ItemValue::Word(u16::from_be_bytes([b[0], b[1]])),
        ValueKind::Int => ItemValue::Int(i16::from_be_bytes([b[0], b[1]])),
        ValueKind::DWord => ItemValue::DWord(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        ValueKind::DInt => ItemValue::DInt(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        ValueKind::Real => {
            ItemValue::Real(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        ValueKind::Timer => {
            ItemValue::Duration(s5time_to_duration(u16::from_be_bytes([b[0], b[1]])))
        }
        ValueKind::Counter => ItemValue::Counter(bcd16_to_value(u16::from_be_bytes([b[0], b[1]]))),
        ValueKind::Time => ItemValue::Duration(ChronoDuration::milliseconds(
            u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64,
        )),
        ValueKind::DateTime => ItemValue::DateTime(
            decode_datetime8(b).ok_or(Error::unexpected("invalid DATE_AND_TIME bytes"))?,
        ),
        ValueKind::Bool | ValueKind::String => unreachable!("handled by caller"),
    })
}

fn decode_bits(tag: &ParsedTag, buf: &[u8]) -> Result<ItemValue> {
    let count = tag.address.count as usize;
    let first_bit = tag.address.bit_offset as usize;
    if buf.len() * 8 < first_bit + count {
        return Err(Error::unexpected("bit window shorter than value"));
    }
    let bit_at = |i: usize| {
        let pos = first_bit + i;
        (buf[pos / 8] >> (pos % 8)) & 1 != 0
    };
    if count == 1 {
        return Ok(ItemValue::Bool(bit_at(0)));
    }
    Ok(ItemValue::Array(
        (0..count).map(|i| ItemValue::Bool(bit_at(i))).collect(),
    ))
}

fn decode_string(tag: &ParsedTag, buf: &[u8]) -> Result<ItemValue> {
    if buf.len() < 2 {
        return Err(Error::unexpected("string buffer shorter than header"));
    }
    let len = (buf[1] as usize).min(buf.len() - 2).min(tag.string_capacity as usize);
    Ok(ItemValue::String(latin1_bytes_to_string(&buf[2..2 + len])))
}

fn encode_value(tag: &ParsedTag, value: &ItemValue, dst: &mut BytesMut) -> Result<()> {
    let count = tag.address.count as usize;
    match (tag.kind, value) {
        (ValueKind::String, _) => encode_string(tag, value, dst),
        (ValueKind::Bool, ItemValue::Bool(v)) => {
            if count != 1 {
                return Err(Error::InvalidArgument(
                    "bit array writes are not supported".into(),
                ));
            }
            dst.put_u8(u8::from(*v));
            Ok(())
        }
        (_, ItemValue::Array(values)) => {
            if values.len() != count {
                return Err(Error::InvalidArgument(format!(
                    "array length {} does not match tag length {count}",
                    values.len()
                )));
            }
            for v in values {
                encode_scalar(tag.kind, v, dst)?;
            }
            Ok(())
        }
        _ => {
            if count != 1 {
                return Err(Error::InvalidArgument(format!(
                    "tag expects an array of {count} elements"
                )));
            }
            encode_scalar(tag.kind, value, dst)
        }
    }
}

fn encode_scalar(kind: ValueKind, value: &ItemValue, dst: &mut BytesMut) -> Result<()> {
    match (kind, value) {
        (ValueKind::Byte, ItemValue::Byte(v)) => dst.put_u8(*v),
        (ValueKind::Char, ItemValue::Char(v)) => dst.put_u8(*v as u8),
        (ValueKind::Word, ItemValue::Word(v)) => dst.put_u16(*v),
        (ValueKind::Int, ItemValue::Int(v)) => dst.put_i16(*v),
        (ValueKind::DWord, ItemValue::DWord(v)) => dst.put_u32(*v),
        (ValueKind::DInt, ItemValue::DInt(v)) => dst.put_i32(*v),
        (ValueKind::Real, ItemValue::Real(v)) => dst.put_u32(v.to_bits()),
        (ValueKind::Timer, ItemValue::Duration(v)) => dst.put_u16(s5time_from_duration(*v)),
        (ValueKind::Counter, ItemValue::Counter(v)) => {
            let v = (*v).min(999);
            let bcd = (dec_to_bcd((v / 100) as u8 % 10) as u16) << 8
                | dec_to_bcd((v % 100) as u8) as u16;
            dst.put_u16(bcd);
        }
        (ValueKind::Time, ItemValue::Duration(v)) => {
            dst.put_u32(v.num_milliseconds().clamp(0, u32::MAX as i64) as u32)
        }
        (ValueKind::DateTime, ItemValue::DateTime(v)) => dst.put_slice(&encode_datetime8(v)),
        (kind, other) => {
            return Err(Error::InvalidArgument(format!(
                "value {other:?} does not match tag kind {kind:?}"
            )))
        }
    }
    Ok(())
}

fn encode_string(tag: &ParsedTag, value: &ItemValue, dst: &mut BytesMut) -> Result<()> {
    let s = match value {
        ItemValue::String(s) => s,
        other => {
            return Err(Error::InvalidArgument(format!(
                "value {other:?} does not match tag kind String"
            )))
        }
    };
    let cap = tag.string_capacity as usize;
    let len = s.len().min(cap);
    dst.put_u8(cap as u8);
    dst.put_u8(len as u8);
    for b in s.bytes().take(len) {
        dst.put_u8(b);
    }
    // Zero-fill the unused capacity so the controller's string stays clean.
    for _ in len..cap {
        dst.put_u8(0);
    }
    Ok(())
}
