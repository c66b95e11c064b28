use super::super::error::{Error, Result};

/// Default source TSAP for a client connection.
pub const DEFAULT_SRC_TSAP: u16 = 0x0100;

/// Derive the destination TSAP from rack and slot, the scheme used by the
/// S7-300/400/1200/1500 families: `0x0100 | (rack << 5) | slot`.
pub fn dst_tsap_for(rack: u8, slot: u8) -> Result<u16> {
    if rack > 0x07 {
        return Err(Error::InvalidArgument(format!(
            "rack {rack} out of range (0..=7)"
        )));
    }
    if slot > 0x1F {
        return Err(Error::InvalidArgument(format!(
            "slot {slot} out of range (0..=31)"
        )));
    }
    Ok(0x0100 | ((rack as u16) << 5) | slot as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_standard_tsaps() {
        assert_eq!(dst_tsap_for(0, 2).unwrap(), 0x0102);
        assert_eq!(dst_tsap_for(0, 1).unwrap(), 0x0101);
        assert_eq!(dst_tsap_for(1, 2).unwrap(), 0x0122);
        assert!(dst_tsap_for(8, 0).is_err());
        assert!(dst_tsap_for(0, 32).is_err());
    }
}
