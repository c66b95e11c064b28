use super::comm::S7Header;
use super::iter::VarSpec;
use super::owned::{
    AckParamOwned, AckPayloadOwned, JobParamOwned, JobPayloadOwned, UserDataParamOwned,
    UserDataPayloadOwned, WriteDataItem,
};
use super::types::{
    DataTransport, FunctionGroup, ReturnCode, UserDataType, USERDATA_METHOD_REQUEST,
    USERDATA_METHOD_RESPONSE,
};
use super::wire::WireEncode;
use bytes::{Bytes, BytesMut};

/// Serialize a Job PDU from owned parameter and optional payload. The PDU
/// reference is left 0; the IO driver patches it on admission.
pub fn build_job(param: JobParamOwned, payload: Option<JobPayloadOwned>) -> BytesMut {
    let param_len = param.encoded_len();
    let data_len = payload.as_ref().map(WireEncode::encoded_len).unwrap_or(0);
    let header = S7Header::job(0, param_len as u16, data_len as u16);

    let mut buf = BytesMut::with_capacity(10 + param_len + data_len);
    header.encode_to(&mut buf);
    param.encode_to(&mut buf);
    if let Some(p) = payload {
        p.encode_to(&mut buf);
    }
    buf
}

/// Setup Communication job.
pub fn build_setup(amq_caller: u16, amq_callee: u16, pdu_len: u16) -> BytesMut {
    build_job(
        JobParamOwned::Setup {
            amq_caller,
            amq_callee,
            pdu_len,
        },
        None,
    )
}

/// ReadVar job for a list of variable specifications.
pub fn build_read_var(specs: Vec<VarSpec>) -> BytesMut {
    build_job(JobParamOwned::ReadVar { specs }, None)
}

/// WriteVar job. `specs` and `items` must be parallel.
pub fn build_write_var(specs: Vec<VarSpec>, items: Vec<WriteDataItem>) -> BytesMut {
    build_job(
        JobParamOwned::WriteVar { specs },
        Some(JobPayloadOwned::WriteVar { items }),
    )
}

/// Start Upload job for a block file name such as `_0A00001A`.
pub fn build_start_upload(filename: Vec<u8>) -> BytesMut {
    build_job(JobParamOwned::StartUpload { filename }, None)
}

/// Upload continuation job.
pub fn build_upload(upload_id: u32) -> BytesMut {
    build_job(JobParamOwned::Upload { upload_id }, None)
}

/// End Upload job.
pub fn build_end_upload(upload_id: u32) -> BytesMut {
    build_job(JobParamOwned::EndUpload { upload_id }, None)
}

/// Serialize an AckData PDU, used by test fixtures acting as the controller.
pub fn build_ack_data(
    pdu_ref: u16,
    error: (u8, u8),
    param: AckParamOwned,
    payload: Option<AckPayloadOwned>,
) -> BytesMut {
    let param_len = param.encoded_len();
    let data_len = payload.as_ref().map(WireEncode::encoded_len).unwrap_or(0);
    let header = S7Header::ack_data(pdu_ref, param_len as u16, data_len as u16, error);

    let mut buf = BytesMut::with_capacity(12 + param_len + data_len);
    header.encode_to(&mut buf);
    param.encode_to(&mut buf);
    if let Some(p) = payload {
        p.encode_to(&mut buf);
    }
    buf
}

/// User-data request PDU for a function group and subfunction. An empty
/// `data` still emits the mandatory payload item header with a Null
/// transport, which is how controllers expect parameterless requests.
pub fn build_user_data_request(
    group: FunctionGroup,
    subfunction: u8,
    sequence: u8,
    data: Bytes,
) -> BytesMut {
    let param = UserDataParamOwned {
        method: USERDATA_METHOD_REQUEST,
        typ: UserDataType::Request,
        group,
        subfunction,
        sequence,
        response: None,
    };
    let payload = UserDataPayloadOwned {
        return_code: if data.is_empty() {
            ReturnCode::ObjectNotFound
        } else {
            ReturnCode::DataOk
        },
        transport: if data.is_empty() {
            DataTransport::Null
        } else {
            DataTransport::OctetString
        },
        data,
    };
    build_user_data(param, payload)
}

/// Continuation request acknowledging a partial user-data response; the
/// sequence echoes the received data-unit reference.
pub fn build_user_data_continue(
    group: FunctionGroup,
    subfunction: u8,
    data_unit_ref: u8,
) -> BytesMut {
    let param = UserDataParamOwned {
        method: USERDATA_METHOD_RESPONSE,
        typ: UserDataType::Request,
        group,
        subfunction,
        sequence: data_unit_ref,
        response: None,
    };
    let payload = UserDataPayloadOwned {
        return_code: ReturnCode::ObjectNotFound,
        transport: DataTransport::Null,
        data: Bytes::new(),
    };
    build_user_data(param, payload)
}

fn build_user_data(param: UserDataParamOwned, payload: UserDataPayloadOwned) -> BytesMut {
    let param_len = param.encoded_len();
    let data_len = payload.encoded_len();
    let header = S7Header::user_data(0, param_len as u16, data_len as u16);

    let mut buf = BytesMut::with_capacity(10 + param_len + data_len);
    header.encode_to(&mut buf);
    param.encode_to(&mut buf);
    payload.encode_to(&mut buf);
    buf
}

/// User-data response PDU, used by test fixtures acting as the controller.
pub fn build_user_data_response(
    group: FunctionGroup,
    subfunction: u8,
    sequence: u8,
    head: super::r#ref::UserDataResponseHead,
    data: Bytes,
) -> BytesMut {
    let param = UserDataParamOwned {
        method: USERDATA_METHOD_RESPONSE,
        typ: UserDataType::Response,
        group,
        subfunction,
        sequence,
        response: Some(head),
    };
    let payload = UserDataPayloadOwned {
        return_code: ReturnCode::DataOk,
        transport: DataTransport::OctetString,
        data,
    };
    build_user_data(param, payload)
}
