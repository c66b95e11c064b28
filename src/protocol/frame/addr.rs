use super::super::error::{Error, Result};
use super::types::{MemoryArea, Transport};
use serde::{Deserialize, Serialize};

/// Decoded value kind of a tag. The wire transport used for addressing is
/// derived from it; complex kinds (strings, timestamps) travel as byte
/// windows and are decoded by the item layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    String,
    Timer,
    Counter,
    DateTime,
    Time,
}

impl ValueKind {
    /// Bytes per element. `Bool` is bit-addressed and handled separately;
    /// `String` carries its capacity in the tag and is also special-cased.
    pub fn element_bytes(self) -> usize {
        match self {
            ValueKind::Bool => 1,
            ValueKind::Byte | ValueKind::Char => 1,
            ValueKind::Word | ValueKind::Int | ValueKind::Timer | ValueKind::Counter => 2,
            ValueKind::DWord | ValueKind::DInt | ValueKind::Real | ValueKind::Time => 4,
            ValueKind::DateTime => 8,
            ValueKind::String => 0,
        }
    }

    /// The address-record transport for this kind.
    pub fn transport(self) -> Transport {
        match self {
            ValueKind::Bool => Transport::Bit,
            ValueKind::Byte => Transport::Byte,
            ValueKind::Char => Transport::Char,
            ValueKind::Word => Transport::Word,
            ValueKind::Int => Transport::Int,
            ValueKind::DWord => Transport::DWord,
            ValueKind::DInt => Transport::DInt,
            ValueKind::Real => Transport::Real,
            ValueKind::Timer => Transport::Timer,
            ValueKind::Counter => Transport::Counter,
            // Strings and timestamps are addressed as byte windows.
            ValueKind::String | ValueKind::DateTime | ValueKind::Time => Transport::Byte,
        }
    }
}

/// Typed PLC variable address with pre-parsed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAddress {
    pub area: MemoryArea,
    /// Data block number when `area` is DB/IDB, else 0.
    pub db: u16,
    pub transport: Transport,
    pub byte_offset: u32,
    /// Bit index 0..=7; nonzero only for bit-addressed tags.
    pub bit_offset: u8,
    /// Number of array elements, >= 1.
    pub count: u16,
}

/// Fully resolved tag: address plus the derived codec facts the item layer
/// needs (value kind, wire transports, buffer sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTag {
    pub address: TagAddress,
    pub kind: ValueKind,
    /// S7-ANY transport used when this tag is read on its own. Bit tags are
    /// promoted to byte addressing for reads.
    pub read_transport: Transport,
    /// S7-ANY transport used for writes. Bit tags stay bit-granular.
    pub write_transport: Transport,
    /// String capacity (payload characters) for `ValueKind::String`.
    pub string_capacity: u8,
    /// Bytes the controller returns for this tag.
    pub byte_length: usize,
    /// Bytes sent in writes, rounded up to even for word-aligned transports.
    pub byte_length_with_fill: usize,
}

/// Type tokens, longest first so prefixes never shadow longer forms.
const TOKENS: &[(&str, ValueKind)] = &[
    ("STRING", ValueKind::String),
    ("DWORD", ValueKind::DWord),
    ("DINT", ValueKind::DInt),
    ("TIME", ValueKind::Time),
    ("CHAR", ValueKind::Char),
    ("BYTE", ValueKind::Byte),
    ("WORD", ValueKind::Word),
    ("REAL", ValueKind::Real),
    ("BIT", ValueKind::Bool),
    ("INT", ValueKind::Int),
    ("DW", ValueKind::DWord),
    ("DI", ValueKind::DInt),
    ("DT", ValueKind::DateTime),
    ("X", ValueKind::Bool),
    ("B", ValueKind::Byte),
    ("C", ValueKind::Char),
    ("W", ValueKind::Word),
    ("I", ValueKind::Int),
    ("S", ValueKind::String),
    ("R", ValueKind::Real),
    ("D", ValueKind::DWord),
];

/// Parse a textual tag address.
///
/// Accepted forms (case-insensitive):
/// - `DB<n>,<TYPE><byte>[.<bit>][.<len>]` - `DB5,REAL12.4`, `DB1,INT2`, `DB2,X3.6`
/// - `DB<n>.DB<T><byte>[.<bit>]` - `DB1.DBW2`, `DB1.DBX0.7`
/// - `<area><TYPE><byte>[.<bit>][.<len>]` - `M10.3`, `IW0`, `QB2`
/// - `T<n>` / `C<n>` - timers and counters by index
pub fn parse_tag(input: &str) -> Result<ParsedTag> {
    let s = input.trim().to_uppercase();
    if s.is_empty() {
        return Err(Error::ParseAddr(input.to_string()));
    }

    let parsed = parse_db_form(&s)
        .or_else(|| parse_timer_counter(&s))
        .or_else(|| parse_short_area(&s));

    match parsed {
        Some(Ok(tag)) => Ok(tag),
        Some(Err(_)) | None => Err(Error::ParseAddr(input.to_string())),
    }
}

/// `DB<n>,...` / `DB<n>....` and the instance-db variant `DI<n>,...`.
fn parse_db_form(s: &str) -> Option<Result<ParsedTag>> {
    let (area, rest) = if let Some(rest) = s.strip_prefix("DB") {
        (MemoryArea::Db, rest)
    } else if let Some(rest) = s.strip_prefix("DI") {
        // Only treat as instance DB when a block number follows; otherwise
        // this is the DINT type token of a short-area form.
        if !rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        (MemoryArea::InstanceDb, rest)
    } else {
        return None;
    };
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    Some((|| {
        let sep = rest
            .find([',', '.'])
            .ok_or_else(|| Error::ParseAddr(s.to_string()))?;
        let db: u16 = rest[..sep]
            .parse()
            .map_err(|_| Error::ParseAddr(s.to_string()))?;
        if db == 0 {
            return Err(Error::ParseAddr(s.to_string()));
        }
        let mut tail = &rest[sep + 1..];
        // Dotted Siemens form repeats the DB marker: DB1.DBW2, DB1.DBX0.7
        if let Some(stripped) = tail.strip_prefix("DB") {
            if stripped.starts_with(['X', 'B', 'W', 'D']) {
                tail = stripped;
            }
        }
        parse_typed_tail(area, db, tail).ok_or_else(|| Error::ParseAddr(s.to_string()))?
    })())
}

/// `T<n>[.<len>]` and `C<n>[.<len>]`.
fn parse_timer_counter(s: &str) -> Option<Result<ParsedTag>> {
    let (area, kind, rest) = if let Some(rest) = s.strip_prefix('T') {
        (MemoryArea::Timers, ValueKind::Timer, rest)
    } else if let Some(rest) = s.strip_prefix('C') {
        (MemoryArea::Counters, ValueKind::Counter, rest)
    } else {
        return None;
    };
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    Some((|| {
        let (index_s, count) = match rest.split_once('.') {
            Some((idx, cnt)) => {
                let count: u16 = cnt.parse().map_err(|_| Error::ParseAddr(s.to_string()))?;
                (idx, count)
            }
            None => (rest, 1),
        };
        let index: u32 = index_s
            .parse()
            .map_err(|_| Error::ParseAddr(s.to_string()))?;
        if count == 0 {
            return Err(Error::ParseAddr(s.to_string()));
        }
        let transport = kind.transport();
        let address = TagAddress {
            area,
            db: 0,
            transport,
            byte_offset: index,
            bit_offset: 0,
            count,
        };
        let byte_length = kind.element_bytes() * count as usize;
        Ok(ParsedTag {
            address,
            kind,
            read_transport: transport,
            write_transport: transport,
            string_capacity: 0,
            byte_length,
            byte_length_with_fill: byte_length,
        })
    })())
}

/// `I`/`E` inputs, `Q`/`A` outputs, `M`/`F` flags.
fn parse_short_area(s: &str) -> Option<Result<ParsedTag>> {
    let area = match s.chars().next()? {
        'I' | 'E' => MemoryArea::Inputs,
        'Q' | 'A' => MemoryArea::Outputs,
        'M' | 'F' => MemoryArea::Flags,
        _ => return None,
    };
    let tail = &s[1..];
    match parse_typed_tail(area, 0, tail) {
        Some(res) => Some(res),
        None => Some(Err(Error::ParseAddr(s.to_string()))),
    }
}

/// Parse `<TYPE><byte>[.<bit>][.<len>]`, falling back to the bare
/// `<byte>.<bit>` bit form and the bare `<byte>` byte form.
fn parse_typed_tail(area: MemoryArea, db: u16, tail: &str) -> Option<Result<ParsedTag>> {
    if tail.is_empty() {
        return None;
    }

    for (token, kind) in TOKENS {
        if let Some(rest) = tail.strip_prefix(token) {
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            return Some(build_tag(area, db, *kind, rest));
        }
    }

    // Bare forms: `10.3` is a bit, `10` is a byte.
    if tail.starts_with(|c: char| c.is_ascii_digit()) {
        if tail.contains('.') {
            return Some(build_tag(area, db, ValueKind::Bool, tail));
        }
        return Some(build_tag(area, db, ValueKind::Byte, tail));
    }
    None
}

/// Assemble the tag from a numeric tail: `<byte>[.<bit>][.<len>]`.
fn build_tag(area: MemoryArea, db: u16, kind: ValueKind, tail: &str) -> Result<ParsedTag> {
    let bad = || Error::ParseAddr(format!("{area:?} {tail}"));
    let mut fields = tail.split('.');
    let byte_offset: u32 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if byte_offset > 0x001F_FFFF {
        return Err(bad());
    }

    let mut bit_offset = 0u8;
    let mut count = 1u16;
    let mut string_capacity = 0u8;

    match kind {
        ValueKind::Bool => {
            // Bit offset is mandatory, array length optional.
            bit_offset = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            if bit_offset > 7 {
                return Err(bad());
            }
            if let Some(len) = fields.next() {
                count = len.parse().map_err(|_| bad())?;
            }
        }
        ValueKind::String => {
            // The first suffix is the declared string capacity.
            string_capacity = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            if string_capacity == 0 {
                return Err(bad());
            }
        }
        _ => {
            if let Some(len) = fields.next() {
                count = len.parse().map_err(|_| bad())?;
            }
        }
    }
    if fields.next().is_some() || count == 0 {
        return Err(bad());
    }

    let transport = kind.transport();
    let byte_length = match kind {
        ValueKind::Bool => (bit_offset as usize + count as usize).div_ceil(8),
        ValueKind::String => string_capacity as usize + 2,
        _ => kind.element_bytes() * count as usize,
    };
    let byte_length_with_fill = if transport.is_word_aligned() {
        byte_length.div_ceil(2) * 2
    } else {
        byte_length
    };

    Ok(ParsedTag {
        address: TagAddress {
            area,
            db,
            transport,
            byte_offset,
            bit_offset,
            count,
        },
        kind,
        read_transport: if kind == ValueKind::Bool {
            Transport::Byte
        } else {
            transport
        },
        write_transport: transport,
        string_capacity,
        byte_length,
        byte_length_with_fill,
    })
}
