use super::super::error::{Error, Result};
use super::iter::{DataItemIter, DataItemRef, StatusItemIter, VarSpecIter};
use super::types::{
    DataTransport, Function, FunctionGroup, PduType, ReturnCode, UserDataType,
    UPLOAD_CHUNK_MARKER,
};

/// Setup Communication parameters, identical for Job and AckData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupParam {
    pub amq_caller: u16,
    pub amq_callee: u16,
    pub pdu_len: u16,
}

/// ReadVar/WriteVar parameter: item count plus the raw spec tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemsParam<'a> {
    pub item_count: u8,
    pub raw: &'a [u8],
}

impl<'a> ItemsParam<'a> {
    pub fn iter_specs(&self) -> VarSpecIter<'a> {
        VarSpecIter::new(self.item_count, self.raw)
    }
}

/// Start Upload job parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartUploadJob<'a> {
    pub upload_id: u32,
    /// Filename bytes, e.g. `_0A00001A` (block file in filesystem A).
    pub filename: &'a [u8],
}

/// Start Upload AckData parameter: the id to use for the rest of the
/// handshake plus the ascii block-length hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartUploadAck<'a> {
    pub upload_id: u32,
    pub block_len: &'a [u8],
}

/// Upload / End Upload job parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueUploadJob {
    pub upload_id: u32,
}

/// Upload AckData parameter: whether more chunks follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAck {
    pub more_follows: bool,
}

/// Segmented user-data parameter head shared by requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParam {
    /// 0x11 request, 0x12 response
    pub method: u8,
    pub typ: UserDataType,
    pub group: FunctionGroup,
    pub subfunction: u8,
    pub sequence: u8,
    /// Present on responses only.
    pub response: Option<UserDataResponseHead>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataResponseHead {
    pub data_unit_ref: u8,
    /// 0x00 = more data units follow, 0x01 = last.
    pub last_data_unit: bool,
    pub error: u16,
}

/// Parsed parameter block, dispatched on ROSCTR and function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRef<'a> {
    JobSetup(SetupParam),
    JobReadVar(ItemsParam<'a>),
    JobWriteVar(ItemsParam<'a>),
    JobStartUpload(StartUploadJob<'a>),
    JobUpload(ContinueUploadJob),
    JobEndUpload(ContinueUploadJob),
    AckSetup(SetupParam),
    AckReadVar { item_count: u8 },
    AckWriteVar { item_count: u8 },
    AckStartUpload(StartUploadAck<'a>),
    AckUpload(UploadAck),
    AckEndUpload,
    UserData(UserDataParam),
    /// Bare Ack carries no structured parameter.
    Ack(&'a [u8]),
}

/// Parsed data block, shaped by the parameter it accompanies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRef<'a> {
    /// WriteVar request / ReadVar response items.
    DataItems { item_count: u8, raw: &'a [u8] },
    /// WriteVar response return codes.
    StatusItems { item_count: u8, raw: &'a [u8] },
    /// Upload chunk: length-prefixed, marker-tagged block bytes.
    UploadChunk(&'a [u8]),
    /// User-data payload: one data item.
    UserData(DataItemRef<'a>),
    Empty,
}

impl<'a> PayloadRef<'a> {
    pub fn iter_data_items(&self) -> Option<DataItemIter<'a>> {
        match self {
            PayloadRef::DataItems { item_count, raw } => Some(DataItemIter::new(*item_count, raw)),
            _ => None,
        }
    }

    pub fn iter_status_items(&self) -> Option<StatusItemIter<'a>> {
        match self {
            PayloadRef::StatusItems { item_count, raw } => {
                Some(StatusItemIter::new(*item_count, raw))
            }
            _ => None,
        }
    }
}

/// Parse a parameter block. Unknown function codes inside a recognized ROSCTR
/// are fatal for the owning PDU.
pub fn parse_param(pdu_type: PduType, input: &[u8]) -> Result<ParamRef<'_>> {
    match pdu_type {
        PduType::Ack => Ok(ParamRef::Ack(input)),
        PduType::UserData => parse_user_data_param(input).map(ParamRef::UserData),
        PduType::Job | PduType::AckData => {
            let (&func_raw, rest) = input
                .split_first()
                .ok_or(Error::unexpected("empty parameter block"))?;
            let function = Function::try_from(func_raw)
                .map_err(|_| Error::unexpected("unknown function code"))?;
            match (pdu_type, function) {
                (PduType::Job, Function::SetupCommunication) => {
                    parse_setup(rest).map(ParamRef::JobSetup)
                }
                (PduType::AckData, Function::SetupCommunication) => {
                    parse_setup(rest).map(ParamRef::AckSetup)
                }
                (PduType::Job, Function::ReadVar) => {
                    parse_items_param(rest).map(ParamRef::JobReadVar)
                }
                (PduType::Job, Function::WriteVar) => {
                    parse_items_param(rest).map(ParamRef::JobWriteVar)
                }
                (PduType::AckData, Function::ReadVar) => Ok(ParamRef::AckReadVar {
                    item_count: item_count_of(rest)?,
                }),
                (PduType::AckData, Function::WriteVar) => Ok(ParamRef::AckWriteVar {
                    item_count: item_count_of(rest)?,
                }),
                (PduType::Job, Function::StartUpload) => {
                    parse_start_upload_job(rest).map(ParamRef::JobStartUpload)
                }
                (PduType::AckData, Function::StartUpload) => {
                    parse_start_upload_ack(rest).map(ParamRef::AckStartUpload)
                }
                (PduType::Job, Function::Upload) => {
                    parse_continue_upload(rest).map(ParamRef::JobUpload)
                }
                (PduType::AckData, Function::Upload) => {
                    let more = *rest
                        .first()
                        .ok_or(Error::unexpected("short upload ack param"))?;
                    Ok(ParamRef::AckUpload(UploadAck {
                        more_follows: more != 0,
                    }))
                }
                (PduType::Job, Function::EndUpload) => {
                    parse_continue_upload(rest).map(ParamRef::JobEndUpload)
                }
                (PduType::AckData, Function::EndUpload) => Ok(ParamRef::AckEndUpload),
                (_, Function::CpuService) => Err(Error::unexpected(
                    "user-data function outside UserData PDU",
                )),
                _ => Err(Error::unexpected("function/ROSCTR mismatch")),
            }
        }
    }
}

/// Parse the data block in the context of its parameter.
pub fn parse_payload<'a>(param: &ParamRef<'a>, input: &'a [u8]) -> Result<PayloadRef<'a>> {
    match param {
        ParamRef::JobWriteVar(items) => Ok(PayloadRef::DataItems {
            item_count: items.item_count,
            raw: input,
        }),
        ParamRef::AckReadVar { item_count } => Ok(PayloadRef::DataItems {
            item_count: *item_count,
            raw: input,
        }),
        ParamRef::AckWriteVar { item_count } => Ok(PayloadRef::StatusItems {
            item_count: *item_count,
            raw: input,
        }),
        ParamRef::AckUpload(_) => parse_upload_chunk(input).map(PayloadRef::UploadChunk),
        ParamRef::UserData(_) => {
            if input.is_empty() {
                return Ok(PayloadRef::Empty);
            }
            let (rest, item) = parse_user_data_payload_item(input)?;
            if !rest.is_empty() {
                return Err(Error::unexpected("trailing bytes after user-data item"));
            }
            Ok(PayloadRef::UserData(item))
        }
        _ => {
            if input.is_empty() {
                Ok(PayloadRef::Empty)
            } else {
                Err(Error::unexpected("unexpected data block"))
            }
        }
    }
}

fn parse_setup(input: &[u8]) -> Result<SetupParam> {
    if input.len() < 7 {
        return Err(Error::InsufficientData {
            needed: 7,
            available: input.len(),
        });
    }
    // input[0] is reserved
    Ok(SetupParam {
        amq_caller: u16::from_be_bytes([input[1], input[2]]),
        amq_callee: u16::from_be_bytes([input[3], input[4]]),
        pdu_len: u16::from_be_bytes([input[5], input[6]]),
    })
}

fn item_count_of(input: &[u8]) -> Result<u8> {
    input
        .first()
        .copied()
        .ok_or(Error::unexpected("missing item count"))
}

fn parse_items_param(input: &[u8]) -> Result<ItemsParam<'_>> {
    let (&item_count, raw) = input
        .split_first()
        .ok_or(Error::unexpected("missing item count"))?;
    Ok(ItemsParam { item_count, raw })
}

fn parse_start_upload_job(input: &[u8]) -> Result<StartUploadJob<'_>> {
    if input.len() < 8 {
        return Err(Error::InsufficientData {
            needed: 8,
            available: input.len(),
        });
    }
    let upload_id = u32::from_be_bytes([input[3], input[4], input[5], input[6]]);
    let name_len = input[7] as usize;
    if input.len() < 8 + name_len {
        return Err(Error::unexpected("truncated upload filename"));
    }
    Ok(StartUploadJob {
        upload_id,
        filename: &input[8..8 + name_len],
    })
}

fn parse_start_upload_ack(input: &[u8]) -> Result<StartUploadAck<'_>> {
    if input.len() < 8 {
        return Err(Error::InsufficientData {
            needed: 8,
            available: input.len(),
        });
    }
    let upload_id = u32::from_be_bytes([input[3], input[4], input[5], input[6]]);
    let len = input[7] as usize;
    if input.len() < 8 + len {
        return Err(Error::unexpected("truncated block length field"));
    }
    Ok(StartUploadAck {
        upload_id,
        block_len: &input[8..8 + len],
    })
}

fn parse_continue_upload(input: &[u8]) -> Result<ContinueUploadJob> {
    if input.len() < 7 {
        return Err(Error::InsufficientData {
            needed: 7,
            available: input.len(),
        });
    }
    Ok(ContinueUploadJob {
        upload_id: u32::from_be_bytes([input[3], input[4], input[5], input[6]]),
    })
}

fn parse_upload_chunk(input: &[u8]) -> Result<&[u8]> {
    if input.len() < 4 {
        return Err(Error::InsufficientData {
            needed: 4,
            available: input.len(),
        });
    }
    let len = u16::from_be_bytes([input[0], input[1]]) as usize;
    // The marker word is observed as 0x00FB on real controllers; tolerate
    // other values and surface the chunk as data.
    let _marker = u16::from_be_bytes([input[2], input[3]]);
    if input.len() < 4 + len {
        return Err(Error::unexpected("truncated upload chunk"));
    }
    Ok(&input[4..4 + len])
}

/// User-data parameter head: 0x000112, length, method, type+group nibbles,
/// subfunction, sequence, then on responses data-unit-ref, last-data-unit and
/// a 2-byte error code.
fn parse_user_data_param(input: &[u8]) -> Result<UserDataParam> {
    if input.len() < 8 {
        return Err(Error::InsufficientData {
            needed: 8,
            available: input.len(),
        });
    }
    if input[0] != 0x00 || input[1] != 0x01 || input[2] != 0x12 {
        return Err(Error::unexpected("bad user-data parameter head"));
    }
    let param_len = input[3] as usize;
    let method = input[4];
    let tg = input[5];
    let typ = UserDataType::try_from(tg >> 4)
        .map_err(|_| Error::unexpected("unknown user-data type nibble"))?;
    let group = FunctionGroup::try_from(tg & 0x0F)
        .map_err(|_| Error::unexpected("unknown function group"))?;
    let subfunction = input[6];
    let sequence = input[7];

    let response = if param_len >= 8 {
        if input.len() < 12 {
            return Err(Error::InsufficientData {
                needed: 12,
                available: input.len(),
            });
        }
        Some(UserDataResponseHead {
            data_unit_ref: input[8],
            last_data_unit: input[9] == 0x01,
            error: u16::from_be_bytes([input[10], input[11]]),
        })
    } else {
        None
    };

    Ok(UserDataParam {
        method,
        typ,
        group,
        subfunction,
        sequence,
        response,
    })
}

fn parse_user_data_payload_item(input: &[u8]) -> Result<(&[u8], DataItemRef<'_>)> {
    if input.len() < 4 {
        return Err(Error::InsufficientData {
            needed: 4,
            available: input.len(),
        });
    }
    let rc = ReturnCode::from(input[0]);
    let transport = DataTransport::try_from(input[1])
        .map_err(|_| Error::unexpected("unknown data transport"))?;
    let len_field = u16::from_be_bytes([input[2], input[3]]);
    let data_len = transport.len_field_to_bytes(len_field);
    let body = &input[4..];
    if body.len() < data_len {
        return Err(Error::InsufficientData {
            needed: data_len,
            available: body.len(),
        });
    }
    Ok((
        &body[data_len..],
        DataItemRef {
            return_code: rc,
            transport,
            data: &body[..data_len],
        },
    ))
}

/// Sanity-check for the upload chunk marker, exported for diagnostics.
pub fn is_expected_chunk_marker(marker: u16) -> bool {
    marker == UPLOAD_CHUNK_MARKER
}
