use super::super::error::Result;
use bytes::{BufMut, Bytes};

/// Unified wire encoding trait across the frame layers.
pub trait WireEncode {
    /// Exact number of bytes `encode_to` will append.
    fn encoded_len(&self) -> usize;

    fn encode_to<B: BufMut>(&self, dst: &mut B);
}

/// Unified zero-copy wire decoding trait across the frame layers.
pub trait WireDecode: Sized {
    /// Parse from `input`, returning the remaining slice and the parsed value.
    /// `parent` permits zero-copy `Bytes::slice_ref` construction for types
    /// that retain payload slices.
    fn parse<'a>(input: &'a [u8], parent: &Bytes) -> Result<(&'a [u8], Self)>;
}
