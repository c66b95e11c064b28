use super::iter::VarSpec;
use super::r#ref::{SetupParam, UserDataResponseHead};
use super::types::{
    DataTransport, Function, FunctionGroup, ReturnCode, Transport, UserDataType,
    UPLOAD_CHUNK_MARKER, VAR_SPEC_WIRE_LEN,
};
use super::wire::WireEncode;
use bytes::{BufMut, Bytes};

/// Pick the payload data transport code for a write item.
#[inline]
pub fn data_transport_for(write_transport: Transport) -> DataTransport {
    match write_transport {
        Transport::Bit => DataTransport::Bit,
        Transport::Counter | Transport::Timer => DataTransport::OctetString,
        _ => DataTransport::ByteWordDWord,
    }
}

/// Owned Job parameter variants for outbound encoding.
#[derive(Debug, Clone)]
pub enum JobParamOwned {
    Setup {
        amq_caller: u16,
        amq_callee: u16,
        pdu_len: u16,
    },
    ReadVar {
        specs: Vec<VarSpec>,
    },
    WriteVar {
        specs: Vec<VarSpec>,
    },
    StartUpload {
        filename: Vec<u8>,
    },
    Upload {
        upload_id: u32,
    },
    EndUpload {
        upload_id: u32,
    },
}

impl WireEncode for JobParamOwned {
    fn encoded_len(&self) -> usize {
        match self {
            JobParamOwned::Setup { .. } => 2 + 6,
            JobParamOwned::ReadVar { specs } | JobParamOwned::WriteVar { specs } => {
                2 + specs.len() * VAR_SPEC_WIRE_LEN
            }
            JobParamOwned::StartUpload { filename } => 8 + filename.len(),
            JobParamOwned::Upload { .. } | JobParamOwned::EndUpload { .. } => 7,
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            JobParamOwned::Setup {
                amq_caller,
                amq_callee,
                pdu_len,
            } => {
                dst.put_u8(Function::SetupCommunication as u8);
                dst.put_u8(0x00);
                dst.put_u16(*amq_caller);
                dst.put_u16(*amq_callee);
                dst.put_u16(*pdu_len);
            }
            JobParamOwned::ReadVar { specs } => {
                dst.put_u8(Function::ReadVar as u8);
                dst.put_u8(specs.len() as u8);
                for s in specs {
                    s.encode_to(dst);
                }
            }
            JobParamOwned::WriteVar { specs } => {
                dst.put_u8(Function::WriteVar as u8);
                dst.put_u8(specs.len() as u8);
                for s in specs {
                    s.encode_to(dst);
                }
            }
            JobParamOwned::StartUpload { filename } => {
                dst.put_u8(Function::StartUpload as u8);
                dst.put_u8(0x00);
                dst.put_u16(0x0000);
                dst.put_u32(0); // id assigned by the controller
                dst.put_u8(filename.len() as u8);
                dst.put_slice(filename);
            }
            JobParamOwned::Upload { upload_id } => {
                dst.put_u8(Function::Upload as u8);
                dst.put_u8(0x00);
                dst.put_u16(0x0000);
                dst.put_u32(*upload_id);
            }
            JobParamOwned::EndUpload { upload_id } => {
                dst.put_u8(Function::EndUpload as u8);
                dst.put_u8(0x00);
                dst.put_u16(0x0000);
                dst.put_u32(*upload_id);
            }
        }
    }
}

/// One write item: the wire transport that addressed it plus its encoded
/// bytes. The transport selects the payload data transport code.
#[derive(Debug, Clone)]
pub struct WriteDataItem {
    pub transport: Transport,
    pub data: Bytes,
}

/// Owned Job payload variants.
#[derive(Debug, Clone)]
pub enum JobPayloadOwned {
    WriteVar { items: Vec<WriteDataItem> },
}

impl WireEncode for JobPayloadOwned {
    fn encoded_len(&self) -> usize {
        match self {
            JobPayloadOwned::WriteVar { items } => {
                let mut total = 0;
                for (idx, it) in items.iter().enumerate() {
                    total += 4 + it.data.len();
                    // Pad byte between items when the payload length is odd.
                    if idx + 1 < items.len() && (it.data.len() & 1) == 1 {
                        total += 1;
                    }
                }
                total
            }
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            JobPayloadOwned::WriteVar { items } => {
                for (idx, it) in items.iter().enumerate() {
                    let dt = data_transport_for(it.transport);
                    dst.put_u8(u8::from(ReturnCode::Reserved));
                    dst.put_u8(dt as u8);
                    dst.put_u16(dt.bytes_to_len_field(it.data.len()));
                    dst.put_slice(&it.data);
                    if idx + 1 < items.len() && (it.data.len() & 1) == 1 {
                        dst.put_u8(0x00);
                    }
                }
            }
        }
    }
}

/// Owned AckData parameter variants. The client only emits these from test
/// fixtures; controllers are the usual senders.
#[derive(Debug, Clone)]
pub enum AckParamOwned {
    Setup(SetupParam),
    ReadVar { item_count: u8 },
    WriteVar { item_count: u8 },
    StartUpload { upload_id: u32, block_len: Vec<u8> },
    Upload { more_follows: bool },
    EndUpload,
}

impl WireEncode for AckParamOwned {
    fn encoded_len(&self) -> usize {
        match self {
            AckParamOwned::Setup(_) => 2 + 6,
            AckParamOwned::ReadVar { .. } | AckParamOwned::WriteVar { .. } => 2,
            AckParamOwned::StartUpload { block_len, .. } => 8 + block_len.len(),
            AckParamOwned::Upload { .. } => 2,
            AckParamOwned::EndUpload => 1,
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            AckParamOwned::Setup(p) => {
                dst.put_u8(Function::SetupCommunication as u8);
                dst.put_u8(0x00);
                dst.put_u16(p.amq_caller);
                dst.put_u16(p.amq_callee);
                dst.put_u16(p.pdu_len);
            }
            AckParamOwned::ReadVar { item_count } => {
                dst.put_u8(Function::ReadVar as u8);
                dst.put_u8(*item_count);
            }
            AckParamOwned::WriteVar { item_count } => {
                dst.put_u8(Function::WriteVar as u8);
                dst.put_u8(*item_count);
            }
            AckParamOwned::StartUpload {
                upload_id,
                block_len,
            } => {
                dst.put_u8(Function::StartUpload as u8);
                dst.put_u8(0x00);
                dst.put_u16(0x0100);
                dst.put_u32(*upload_id);
                dst.put_u8(block_len.len() as u8);
                dst.put_slice(block_len);
            }
            AckParamOwned::Upload { more_follows } => {
                dst.put_u8(Function::Upload as u8);
                dst.put_u8(if *more_follows { 0x01 } else { 0x00 });
            }
            AckParamOwned::EndUpload => {
                dst.put_u8(Function::EndUpload as u8);
            }
        }
    }
}

/// One item of a ReadVar response payload.
#[derive(Debug, Clone)]
pub struct ReadResultItem {
    pub return_code: ReturnCode,
    pub transport: DataTransport,
    pub data: Bytes,
}

/// Owned AckData payload variants.
#[derive(Debug, Clone)]
pub enum AckPayloadOwned {
    ReadVar { items: Vec<ReadResultItem> },
    WriteVar { codes: Vec<ReturnCode> },
    UploadChunk { data: Bytes },
}

impl WireEncode for AckPayloadOwned {
    fn encoded_len(&self) -> usize {
        match self {
            AckPayloadOwned::ReadVar { items } => {
                let mut total = 0;
                for (idx, it) in items.iter().enumerate() {
                    total += 4 + it.data.len();
                    if idx + 1 < items.len() && (it.data.len() & 1) == 1 {
                        total += 1;
                    }
                }
                total
            }
            AckPayloadOwned::WriteVar { codes } => codes.len(),
            AckPayloadOwned::UploadChunk { data } => 4 + data.len(),
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            AckPayloadOwned::ReadVar { items } => {
                for (idx, it) in items.iter().enumerate() {
                    dst.put_u8(u8::from(it.return_code));
                    dst.put_u8(it.transport as u8);
                    dst.put_u16(it.transport.bytes_to_len_field(it.data.len()));
                    dst.put_slice(&it.data);
                    if idx + 1 < items.len() && (it.data.len() & 1) == 1 {
                        dst.put_u8(0x00);
                    }
                }
            }
            AckPayloadOwned::WriteVar { codes } => {
                for rc in codes {
                    dst.put_u8(u8::from(*rc));
                }
            }
            AckPayloadOwned::UploadChunk { data } => {
                dst.put_u16(data.len() as u16);
                dst.put_u16(UPLOAD_CHUNK_MARKER);
                dst.put_slice(data);
            }
        }
    }
}

/// Owned user-data parameter. Requests carry the 8-byte head; responses add
/// data-unit-reference, last-data-unit and the error word.
#[derive(Debug, Clone, Copy)]
pub struct UserDataParamOwned {
    pub method: u8,
    pub typ: UserDataType,
    pub group: FunctionGroup,
    pub subfunction: u8,
    pub sequence: u8,
    pub response: Option<UserDataResponseHead>,
}

impl WireEncode for UserDataParamOwned {
    fn encoded_len(&self) -> usize {
        if self.response.is_some() {
            12
        } else {
            8
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(0x00);
        dst.put_u8(0x01);
        dst.put_u8(0x12);
        dst.put_u8(if self.response.is_some() { 0x08 } else { 0x04 });
        dst.put_u8(self.method);
        dst.put_u8(((self.typ as u8) << 4) | (self.group as u8 & 0x0F));
        dst.put_u8(self.subfunction);
        dst.put_u8(self.sequence);
        if let Some(head) = &self.response {
            dst.put_u8(head.data_unit_ref);
            dst.put_u8(if head.last_data_unit { 0x01 } else { 0x00 });
            dst.put_u16(head.error);
        }
    }
}

/// Owned user-data payload: one data item.
#[derive(Debug, Clone)]
pub struct UserDataPayloadOwned {
    pub return_code: ReturnCode,
    pub transport: DataTransport,
    pub data: Bytes,
}

impl WireEncode for UserDataPayloadOwned {
    fn encoded_len(&self) -> usize {
        4 + self.data.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(u8::from(self.return_code));
        dst.put_u8(self.transport as u8);
        dst.put_u16(self.transport.bytes_to_len_field(self.data.len()));
        dst.put_slice(&self.data);
    }
}
