//! Wire constants for the S7 protocol, centralized so the codec, planner and
//! diagnostics only ever reference symbolic names. Inverse lookups
//! (code -> description) live next to the enums they describe.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// S7 PDU kinds (ROSCTR byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Job = 0x01,
    Ack = 0x02,
    AckData = 0x03,
    UserData = 0x07,
}

impl TryFrom<u8> for PduType {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0x01 => Ok(PduType::Job),
            0x02 => Ok(PduType::Ack),
            0x03 => Ok(PduType::AckData),
            0x07 => Ok(PduType::UserData),
            _ => Err(()),
        }
    }
}

/// S7 function codes carried in the parameter block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// User Data wrapper
    CpuService = 0x00,
    /// Read Variable
    ReadVar = 0x04,
    /// Write Variable
    WriteVar = 0x05,
    /// Start upload
    StartUpload = 0x1D,
    /// Upload
    Upload = 0x1E,
    /// End upload
    EndUpload = 0x1F,
    /// Setup Communication
    SetupCommunication = 0xF0,
}

impl TryFrom<u8> for Function {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0x00 => Ok(Function::CpuService),
            0x04 => Ok(Function::ReadVar),
            0x05 => Ok(Function::WriteVar),
            0x1D => Ok(Function::StartUpload),
            0x1E => Ok(Function::Upload),
            0x1F => Ok(Function::EndUpload),
            0xF0 => Ok(Function::SetupCommunication),
            _ => Err(()),
        }
    }
}

/// S7-ANY syntax identifier used in ReadVar/WriteVar item specs.
pub const SYNTAX_ID_S7ANY: u8 = 0x10;
/// Variable specification marker preceding each S7-ANY item.
pub const VAR_SPEC_TYPE: u8 = 0x12;
/// Length of the S7-ANY fields following the spec marker and length byte.
pub const VAR_SPEC_ANY_LEN: u8 = 0x0A;
/// Full on-wire size of one variable specification.
pub const VAR_SPEC_WIRE_LEN: usize = 12;

/// PLC memory areas.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize_repr, Deserialize_repr,
)]
pub enum MemoryArea {
    /// Counters (C)
    Counters = 0x1C,
    /// Timers (T)
    Timers = 0x1D,
    /// System info of the 200 family
    SystemInfo = 0x03,
    /// System flags of the 200 family
    SystemFlags = 0x05,
    /// Inputs (I/E)
    Inputs = 0x81,
    /// Outputs (Q/A)
    Outputs = 0x82,
    /// Flags / merkers (M/F)
    Flags = 0x83,
    /// Data blocks
    Db = 0x84,
    /// Instance data blocks
    InstanceDb = 0x85,
    /// Local data
    Local = 0x86,
    /// V memory (200 family data block 1)
    V = 0x87,
}

impl TryFrom<u8> for MemoryArea {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0x1C => Ok(MemoryArea::Counters),
            0x1D => Ok(MemoryArea::Timers),
            0x03 => Ok(MemoryArea::SystemInfo),
            0x05 => Ok(MemoryArea::SystemFlags),
            0x81 => Ok(MemoryArea::Inputs),
            0x82 => Ok(MemoryArea::Outputs),
            0x83 => Ok(MemoryArea::Flags),
            0x84 => Ok(MemoryArea::Db),
            0x85 => Ok(MemoryArea::InstanceDb),
            0x86 => Ok(MemoryArea::Local),
            0x87 => Ok(MemoryArea::V),
            _ => Err(()),
        }
    }
}

impl MemoryArea {
    /// Whether adjacent reads in this area may be coalesced by the planner.
    #[inline]
    pub fn is_optimizable(self) -> bool {
        matches!(
            self,
            MemoryArea::Db | MemoryArea::Inputs | MemoryArea::Outputs | MemoryArea::Flags
        )
    }

    /// Whether addresses in this area carry a data-block number.
    #[inline]
    pub fn has_db_number(self) -> bool {
        matches!(self, MemoryArea::Db | MemoryArea::InstanceDb)
    }
}

/// Transport size codes used in S7-ANY item specs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
pub enum Transport {
    Bit = 0x01,
    Byte = 0x02,
    Char = 0x03,
    Word = 0x04,
    Int = 0x05,
    DWord = 0x06,
    DInt = 0x07,
    Real = 0x08,
    Octet = 0x09,
    Counter = 0x1C,
    Timer = 0x1D,
}

impl TryFrom<u8> for Transport {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        use Transport::*;
        Ok(match v {
            0x01 => Bit,
            0x02 => Byte,
            0x03 => Char,
            0x04 => Word,
            0x05 => Int,
            0x06 => DWord,
            0x07 => DInt,
            0x08 => Real,
            0x09 => Octet,
            0x1C => Counter,
            0x1D => Timer,
            _ => Err(())?,
        })
    }
}

impl Transport {
    /// Bytes per element. Bit counts as one byte once promoted to byte
    /// addressing for reads.
    #[inline]
    pub fn element_bytes(self) -> usize {
        match self {
            Transport::Bit | Transport::Byte | Transport::Char | Transport::Octet => 1,
            Transport::Word | Transport::Int | Transport::Counter | Transport::Timer => 2,
            Transport::DWord | Transport::DInt | Transport::Real => 4,
        }
    }

    /// Word-aligned transports round their write buffers up to even length.
    #[inline]
    pub fn is_word_aligned(self) -> bool {
        matches!(
            self,
            Transport::Word | Transport::Int | Transport::DWord | Transport::DInt | Transport::Real
        )
    }
}

/// Per-item return codes in read/write responses. Only `DataOk` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Reserved,
    HardwareFault,
    AccessDenied,
    InvalidAddress,
    DataTypeNotSupported,
    DataTypeInconsistent,
    ObjectNotFound,
    ObjectNotAvailable,
    DataOk,
    Unknown(u8),
}

impl From<u8> for ReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => ReturnCode::Reserved,
            0x01 => ReturnCode::HardwareFault,
            0x03 => ReturnCode::AccessDenied,
            0x05 => ReturnCode::InvalidAddress,
            0x06 => ReturnCode::DataTypeNotSupported,
            0x07 => ReturnCode::DataTypeInconsistent,
            0x0A => ReturnCode::ObjectNotFound,
            0x0B => ReturnCode::ObjectNotAvailable,
            0xFF => ReturnCode::DataOk,
            other => ReturnCode::Unknown(other),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(rc: ReturnCode) -> u8 {
        match rc {
            ReturnCode::Reserved => 0x00,
            ReturnCode::HardwareFault => 0x01,
            ReturnCode::AccessDenied => 0x03,
            ReturnCode::InvalidAddress => 0x05,
            ReturnCode::DataTypeNotSupported => 0x06,
            ReturnCode::DataTypeInconsistent => 0x07,
            ReturnCode::ObjectNotFound => 0x0A,
            ReturnCode::ObjectNotAvailable => 0x0B,
            ReturnCode::DataOk => 0xFF,
            ReturnCode::Unknown(v) => v,
        }
    }
}

impl ReturnCode {
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, ReturnCode::DataOk)
    }

    pub fn description(self) -> &'static str {
        match self {
            ReturnCode::Reserved => "reserved",
            ReturnCode::HardwareFault => "hardware fault",
            ReturnCode::AccessDenied => "access denied",
            ReturnCode::InvalidAddress => "invalid address",
            ReturnCode::DataTypeNotSupported => "data type not supported",
            ReturnCode::DataTypeInconsistent => "data type inconsistent",
            ReturnCode::ObjectNotFound => "object not found",
            ReturnCode::ObjectNotAvailable => "object not available",
            ReturnCode::DataOk => "data ok",
            ReturnCode::Unknown(_) => "unknown return code",
        }
    }
}

/// Data transport codes in response/request payload item headers. The length
/// field that follows is in bits for `Bit`/`ByteWordDWord`/`Integer` and in
/// bytes for the rest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransport {
    Null = 0x00,
    Bit = 0x03,
    ByteWordDWord = 0x04,
    Integer = 0x05,
    DInteger = 0x06,
    Real = 0x07,
    OctetString = 0x09,
}

impl TryFrom<u8> for DataTransport {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        Ok(match v {
            0x00 => DataTransport::Null,
            0x03 => DataTransport::Bit,
            0x04 => DataTransport::ByteWordDWord,
            0x05 => DataTransport::Integer,
            0x06 => DataTransport::DInteger,
            0x07 => DataTransport::Real,
            0x09 => DataTransport::OctetString,
            _ => Err(())?,
        })
    }
}

impl DataTransport {
    /// Convert the raw length field to a byte count.
    #[inline]
    pub fn len_field_to_bytes(self, len_field: u16) -> usize {
        match self {
            DataTransport::Null | DataTransport::ByteWordDWord | DataTransport::Integer => {
                (len_field as usize) / 8
            }
            DataTransport::Bit
            | DataTransport::DInteger
            | DataTransport::Real
            | DataTransport::OctetString => len_field as usize,
        }
    }

    /// Convert a byte count to the raw length field.
    #[inline]
    pub fn bytes_to_len_field(self, bytes: usize) -> u16 {
        match self {
            DataTransport::Null | DataTransport::ByteWordDWord | DataTransport::Integer => {
                (bytes as u32 * 8) as u16
            }
            DataTransport::Bit
            | DataTransport::DInteger
            | DataTransport::Real
            | DataTransport::OctetString => bytes as u16,
        }
    }
}

/// User-data function groups (low nibble of the type+group byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    ModeTransition = 0x00,
    ProgrammerCommands = 0x01,
    CyclicServices = 0x02,
    BlockFunctions = 0x03,
    CpuFunctions = 0x04,
    SecurityFunctions = 0x05,
    TimeFunctions = 0x07,
}

impl TryFrom<u8> for FunctionGroup {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0x00 => Ok(FunctionGroup::ModeTransition),
            0x01 => Ok(FunctionGroup::ProgrammerCommands),
            0x02 => Ok(FunctionGroup::CyclicServices),
            0x03 => Ok(FunctionGroup::BlockFunctions),
            0x04 => Ok(FunctionGroup::CpuFunctions),
            0x05 => Ok(FunctionGroup::SecurityFunctions),
            0x07 => Ok(FunctionGroup::TimeFunctions),
            _ => Err(()),
        }
    }
}

/// User-data message direction (high nibble of the type+group byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataType {
    Push = 0x00,
    Request = 0x04,
    Response = 0x08,
}

impl TryFrom<u8> for UserDataType {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0x00 => Ok(UserDataType::Push),
            0x04 => Ok(UserDataType::Request),
            0x08 => Ok(UserDataType::Response),
            _ => Err(()),
        }
    }
}

/// User-data parameter methods.
pub const USERDATA_METHOD_REQUEST: u8 = 0x11;
pub const USERDATA_METHOD_RESPONSE: u8 = 0x12;

/// Subfunctions used by this crate.
pub const SUB_CPU_READ_SZL: u8 = 0x01;
pub const SUB_BLOCK_COUNT: u8 = 0x01;
pub const SUB_BLOCK_LIST: u8 = 0x02;
pub const SUB_BLOCK_INFO: u8 = 0x03;
pub const SUB_CLOCK_READ: u8 = 0x01;
pub const SUB_CLOCK_SET: u8 = 0x04;

/// Well-known SSL (SZL) ids.
pub const SSL_ID_AVAILABLE: u16 = 0x0000;
pub const SSL_ID_MODULE_IDENT: u16 = 0x0011;
pub const SSL_ID_COMPONENT_IDENT: u16 = 0x001C;

/// Marker word preceding each upload data chunk.
pub const UPLOAD_CHUNK_MARKER: u16 = 0x00FB;

/// Program block types addressed by the block services. The wire encoding is
/// the two-character ascii pair used in user-data requests and upload
/// filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Ob,
    Db,
    Sdb,
    Fc,
    Sfc,
    Fb,
    Sfb,
}

impl BlockType {
    pub fn ascii_pair(self) -> [u8; 2] {
        match self {
            BlockType::Ob => *b"08",
            BlockType::Db => *b"0A",
            BlockType::Sdb => *b"0B",
            BlockType::Fc => *b"0C",
            BlockType::Sfc => *b"0D",
            BlockType::Fb => *b"0E",
            BlockType::Sfb => *b"0F",
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x08 | b'8' => Some(BlockType::Ob),
            0x0A | b'A' => Some(BlockType::Db),
            0x0B | b'B' => Some(BlockType::Sdb),
            0x0C | b'C' => Some(BlockType::Fc),
            0x0D | b'D' => Some(BlockType::Sfc),
            0x0E | b'E' => Some(BlockType::Fb),
            0x0F | b'F' => Some(BlockType::Sfb),
            _ => None,
        }
    }
}

/// Description lookup for AckData header error class/code pairs. The table is
/// deliberately partial; unlisted pairs still surface through the error's
/// numeric fields.
pub fn header_error_description(class: u8, code: u8) -> &'static str {
    match (class, code) {
        (0x00, 0x00) => "no error",
        (0x81, _) => "application relationship error",
        (0x82, _) => "object definition error",
        (0x83, _) => "no resources available",
        (0x84, _) => "error on service processing",
        (0x85, 0x00) => "error on supplies",
        (0x85, 0x04) => "invalid service sequence",
        (0x87, _) => "access error",
        (0xD2, _) => "address error in block",
        (0xD4, _) => "unknown request type",
        (0xD6, 0x01) => "block name syntax error",
        (0xD6, 0x02) => "syntax error in function parameter",
        (0xD6, 0x04) => "unknown block type",
        (0xD6, 0x05) => "object already exists",
        (0xD6, 0x07) => "block write-protected",
        (0xD2, 0x40) => "coordination rule violated",
        _ => "unrecognized error pair",
    }
}

// ===== BCD and time helpers shared by the item codec and clock services =====

/// Convert Latin-1 bytes to a Rust `String` by widening each byte.
pub(crate) fn latin1_bytes_to_string(input: &[u8]) -> String {
    input.iter().map(|&b| b as char).collect()
}

/// Convert one BCD-encoded byte to decimal 0..=99.
#[inline]
pub(crate) fn bcd_to_dec(b: u8) -> u8 {
    ((b >> 4) & 0x0F) * 10 + (b & 0x0F)
}

/// Convert decimal 0..=99 to one BCD-encoded byte.
#[inline]
pub(crate) fn dec_to_bcd(d: u8) -> u8 {
    ((d / 10) << 4) | (d % 10)
}

/// Decode a BCD-coded 16-bit counter value (3 digits, 0..=999).
pub(crate) fn bcd16_to_value(raw: u16) -> u16 {
    let mut value = 0u16;
    let mut factor = 1u16;
    let mut tmp = raw;
    for _ in 0..3 {
        value += (tmp & 0xF) * factor;
        factor *= 10;
        tmp >>= 4;
    }
    value
}

/// Decode S5TIME/TIMER raw 16 bits into a `Duration`. The top nibble selects
/// the time base (10ms/100ms/1s/10s), the low 12 bits are three BCD digits.
pub(crate) fn s5time_to_duration(raw: u16) -> Duration {
    let time_base = (raw >> 12) & 0x0003;
    let units = bcd16_to_value(raw & 0x0FFF) as u32;
    let mult = match time_base {
        0 => 10u32,
        1 => 100,
        2 => 1000,
        _ => 10000,
    };
    Duration::milliseconds((units.saturating_mul(mult)) as i64)
}

/// Encode a `Duration` into S5TIME raw 16 bits, smallest base that fits.
pub(crate) fn s5time_from_duration(dur: Duration) -> u16 {
    let total_ms = dur.num_milliseconds().max(0) as u64;
    const BASES: &[(u16, u64)] = &[(0, 10), (1, 100), (2, 1000), (3, 10_000)];
    let mut base_sel = BASES[BASES.len() - 1];
    for &(code, step) in BASES {
        if total_ms / step <= 999 {
            base_sel = (code, step);
            break;
        }
    }
    let units = (total_ms / base_sel.1).min(999) as u16;
    let bcd = ((units / 100) << 8) | (((units / 10) % 10) << 4) | (units % 10);
    (base_sel.0 << 12) | bcd
}

/// Decode the 8-byte S7 DATE_AND_TIME (BCD) into a `NaiveDateTime`.
pub(crate) fn decode_datetime8(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 8 {
        return None;
    }
    let yy = bcd_to_dec(bytes[0]) as i32;
    let year = if yy < 90 { 2000 + yy } else { 1900 + yy };
    let month = bcd_to_dec(bytes[1]) as u32;
    let day = bcd_to_dec(bytes[2]) as u32;
    let hour = bcd_to_dec(bytes[3]) as u32;
    let minute = bcd_to_dec(bytes[4]) as u32;
    let second = bcd_to_dec(bytes[5]) as u32;
    let ms_high = bcd_to_dec(bytes[6]) as u32;
    // Low byte carries one millisecond digit in the high nibble and the
    // day-of-week in the low nibble.
    let ms_low = ((bytes[7] >> 4) & 0x0F) as u32;
    let millis = ms_high * 10 + ms_low;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    date.and_hms_milli_opt(hour, minute, second, millis)
}

/// Encode a `NaiveDateTime` into the 8-byte S7 DATE_AND_TIME (BCD).
pub(crate) fn encode_datetime8(dt: &NaiveDateTime) -> [u8; 8] {
    let yy = (dt.year() % 100) as u8;
    let millis = dt.and_utc().timestamp_subsec_millis();
    let weekday = dt.weekday().number_from_sunday() as u8;
    [
        dec_to_bcd(yy),
        dec_to_bcd(dt.month() as u8),
        dec_to_bcd(dt.day() as u8),
        dec_to_bcd(dt.hour() as u8),
        dec_to_bcd(dt.minute() as u8),
        dec_to_bcd(dt.second() as u8),
        dec_to_bcd((millis / 10) as u8),
        (dec_to_bcd((millis % 10) as u8) << 4) | (weekday & 0x0F),
    ]
}
