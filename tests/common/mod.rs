//! Shared mock controller for the integration tests. Speaks TPKT/COTP/S7
//! over an in-memory duplex stream using the crate's own codec, with a small
//! byte-addressed memory image per (area, db).

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use s7link::protocol::codec::Codec;
use s7link::protocol::frame::builder::{build_ack_data, build_user_data_response};
use s7link::protocol::frame::comm::PDU_REF_OFFSET;
use s7link::protocol::frame::owned::{AckParamOwned, AckPayloadOwned, ReadResultItem};
use s7link::protocol::frame::r#ref::{
    parse_param, parse_payload, ParamRef, PayloadRef, SetupParam, UserDataResponseHead,
};
use s7link::protocol::frame::types::{DataTransport, FunctionGroup, Transport};
use s7link::protocol::frame::{S7AppBody, S7Message, S7Pdu, VarSpec};
use s7link::ReturnCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use futures_util::{SinkExt, StreamExt};
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

#[derive(Clone)]
pub struct MockConfig {
    /// AmQ callee granted in the setup ack.
    pub amq: u16,
    /// PDU length granted in the setup ack.
    pub pdu_size: u16,
    /// Fail every read part in this DB with the given code.
    pub fail_read_db: Option<(u16, u8)>,
    /// Stop answering jobs (but keep reading) after N responses.
    pub stop_after: Option<usize>,
    /// Collect concurrently arriving jobs and answer them as a batch once the
    /// line goes quiet; records the largest batch observed.
    pub hold_batches: bool,
    /// Canned user-data payloads keyed by (function group, subfunction),
    /// split into data units delivered one continuation at a time.
    pub user_data: HashMap<(u8, u8), Vec<Bytes>>,
    /// Uploadable block files: filename -> chunk list.
    pub blocks: HashMap<String, Vec<Vec<u8>>>,
    /// When notified, the mock drops the transport (simulates a dead link).
    pub shutdown: Option<Arc<tokio::sync::Notify>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            amq: 8,
            pdu_size: 480,
            fail_read_db: None,
            stop_after: None,
            hold_batches: false,
            user_data: HashMap::new(),
            blocks: HashMap::new(),
            shutdown: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    /// Remaining data units per (group, sub) continuation.
    segments: HashMap<(u8, u8), Vec<Bytes>>,
    uploads: HashMap<u32, (Vec<Vec<u8>>, usize)>,
    next_upload_id: u32,
    clock_raw: Vec<u8>,
    responses_sent: usize,
}

pub struct MockHandle {
    /// Byte image per (area code, db number).
    pub memory: Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>>,
    /// Largest batch of jobs seen outstanding at once (hold_batches mode).
    pub max_outstanding: Arc<AtomicUsize>,
    /// PDU references observed on received jobs, in arrival order.
    pub seen_refs: Arc<Mutex<Vec<u16>>>,
    pub join: tokio::task::JoinHandle<()>,
}

impl MockHandle {
    pub fn poke(&self, area: u8, db: u16, offset: usize, bytes: &[u8]) {
        let mut mem = self.memory.lock().unwrap();
        let image = mem.entry((area, db)).or_insert_with(|| vec![0u8; 0x10000]);
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, area: u8, db: u16, offset: usize, len: usize) -> Vec<u8> {
        let mut mem = self.memory.lock().unwrap();
        let image = mem.entry((area, db)).or_insert_with(|| vec![0u8; 0x10000]);
        image[offset..offset + len].to_vec()
    }
}

pub fn spawn_mock(stream: DuplexStream, config: MockConfig) -> MockHandle {
    let memory: Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let max_outstanding = Arc::new(AtomicUsize::new(0));
    let seen_refs: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));

    let mem = Arc::clone(&memory);
    let max_seen = Arc::clone(&max_outstanding);
    let refs = Arc::clone(&seen_refs);
    let join = tokio::spawn(async move {
        let mut framed = Framed::new(stream, Codec);
        let mut state = MockState {
            next_upload_id: 1,
            ..Default::default()
        };
        let mut held: Vec<S7Pdu> = Vec::new();

        loop {
            let next = if config.hold_batches && !held.is_empty() {
                match tokio::time::timeout(Duration::from_millis(50), framed.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        // Line went quiet: answer the whole batch in order.
                        max_seen.fetch_max(held.len(), Ordering::Relaxed);
                        for pdu in std::mem::take(&mut held) {
                            if !respond(&mut framed, pdu, &config, &mem, &mut state).await {
                                return;
                            }
                        }
                        continue;
                    }
                }
            } else if let Some(shutdown) = &config.shutdown {
                tokio::select! {
                    item = framed.next() => item,
                    _ = shutdown.notified() => return,
                }
            } else {
                framed.next().await
            };

            match next {
                Some(Ok(msg)) => match msg.cotp {
                    s7link::protocol::frame::Cotp::Cr(params) => {
                        let cc =
                            S7Message::connection_confirm(params.dst_tsap, params.src_tsap);
                        if framed.send(cc).await.is_err() {
                            return;
                        }
                    }
                    s7link::protocol::frame::Cotp::Dt(_) => {
                        if let Some(S7AppBody::Parsed(pdu)) = msg.app {
                            refs.lock().unwrap().push(pdu.header.pdu_ref);
                            if config.hold_batches && !is_setup(&pdu) {
                                held.push(pdu);
                                max_seen.fetch_max(held.len(), Ordering::Relaxed);
                            } else if !respond(&mut framed, pdu, &config, &mem, &mut state).await
                            {
                                return;
                            }
                        }
                    }
                    _ => {}
                },
                Some(Err(_)) | None => return,
            }
        }
    });

    MockHandle {
        memory,
        max_outstanding,
        seen_refs,
        join,
    }
}

fn is_setup(pdu: &S7Pdu) -> bool {
    matches!(
        parse_param(pdu.header.pdu_type, &pdu.param),
        Ok(ParamRef::JobSetup(_))
    )
}

type MockFramed = Framed<DuplexStream, Codec>;

/// Answer one job PDU. Returns false when the transport is gone.
async fn respond(
    framed: &mut MockFramed,
    pdu: S7Pdu,
    config: &MockConfig,
    memory: &Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>>,
    state: &mut MockState,
) -> bool {
    let pdu_ref = pdu.header.pdu_ref;
    let param = match parse_param(pdu.header.pdu_type, &pdu.param) {
        Ok(p) => p,
        Err(_) => return true,
    };

    if !matches!(param, ParamRef::JobSetup(_)) {
        if let Some(limit) = config.stop_after {
            if state.responses_sent >= limit {
                return true; // swallow the job, let the client time out
            }
        }
    }

    let frame: BytesMut = match param {
        ParamRef::JobSetup(setup) => build_ack_data(
            pdu_ref,
            (0, 0),
            AckParamOwned::Setup(SetupParam {
                amq_caller: setup.amq_caller,
                amq_callee: setup.amq_callee.min(config.amq),
                pdu_len: setup.pdu_len.min(config.pdu_size),
            }),
            None,
        ),
        ParamRef::JobReadVar(items) => {
            let specs: Vec<VarSpec> = match items.iter_specs().collect::<Result<_, _>>() {
                Ok(s) => s,
                Err(_) => return true,
            };
            let mut out = Vec::with_capacity(specs.len());
            for spec in &specs {
                out.push(read_one(spec, config, memory));
            }
            build_ack_data(
                pdu_ref,
                (0, 0),
                AckParamOwned::ReadVar {
                    item_count: out.len() as u8,
                },
                Some(AckPayloadOwned::ReadVar { items: out }),
            )
        }
        ParamRef::JobWriteVar(items) => {
            let specs: Vec<VarSpec> = match items.iter_specs().collect::<Result<_, _>>() {
                Ok(s) => s,
                Err(_) => return true,
            };
            let payload = match parse_payload(&ParamRef::JobWriteVar(items), &pdu.data) {
                Ok(p) => p,
                Err(_) => return true,
            };
            let mut codes = Vec::with_capacity(specs.len());
            if let Some(iter) = payload.iter_data_items() {
                for (spec, item) in specs.iter().zip(iter) {
                    let item = match item {
                        Ok(i) => i,
                        Err(_) => return true,
                    };
                    codes.push(write_one(spec, item.data, memory));
                }
            }
            build_ack_data(
                pdu_ref,
                (0, 0),
                AckParamOwned::WriteVar {
                    item_count: codes.len() as u8,
                },
                Some(AckPayloadOwned::WriteVar { codes }),
            )
        }
        ParamRef::JobStartUpload(job) => {
            let name = String::from_utf8_lossy(job.filename).to_string();
            match config.blocks.get(&name) {
                Some(chunks) => {
                    let id = state.next_upload_id;
                    state.next_upload_id += 1;
                    let total: usize = chunks.iter().map(Vec::len).sum();
                    state.uploads.insert(id, (chunks.clone(), 0));
                    build_ack_data(
                        pdu_ref,
                        (0, 0),
                        AckParamOwned::StartUpload {
                            upload_id: id,
                            block_len: format!("{total:07}").into_bytes(),
                        },
                        None,
                    )
                }
                None => build_ack_data(
                    pdu_ref,
                    (0xD6, 0x01),
                    AckParamOwned::StartUpload {
                        upload_id: 0,
                        block_len: Vec::new(),
                    },
                    None,
                ),
            }
        }
        ParamRef::JobUpload(job) => match state.uploads.get_mut(&job.upload_id) {
            Some((chunks, idx)) => {
                let chunk = chunks.get(*idx).cloned().unwrap_or_default();
                *idx += 1;
                let more = *idx < chunks.len();
                build_ack_data(
                    pdu_ref,
                    (0, 0),
                    AckParamOwned::Upload { more_follows: more },
                    Some(AckPayloadOwned::UploadChunk {
                        data: Bytes::from(chunk),
                    }),
                )
            }
            None => build_ack_data(
                pdu_ref,
                (0xD2, 0x40),
                AckParamOwned::Upload {
                    more_follows: false,
                },
                Some(AckPayloadOwned::UploadChunk { data: Bytes::new() }),
            ),
        },
        ParamRef::JobEndUpload(job) => {
            state.uploads.remove(&job.upload_id);
            build_ack_data(pdu_ref, (0, 0), AckParamOwned::EndUpload, None)
        }
        ParamRef::UserData(ud) => {
            user_data_response(pdu_ref, &ud, &pdu, config, state)
        }
        _ => return true,
    };

    state.responses_sent += 1;
    framed
        .send(S7Message::data(frame.freeze()))
        .await
        .is_ok()
}

fn effective_window(spec: &VarSpec) -> (usize, usize) {
    match spec.transport {
        Transport::Counter | Transport::Timer => {
            (spec.byte_offset as usize * 2, spec.count as usize * 2)
        }
        _ => (spec.byte_offset as usize, spec.count as usize),
    }
}

fn read_one(
    spec: &VarSpec,
    config: &MockConfig,
    memory: &Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>>,
) -> ReadResultItem {
    if let Some((db, code)) = config.fail_read_db {
        if spec.db == db {
            return ReadResultItem {
                return_code: ReturnCode::from(code),
                transport: DataTransport::Null,
                data: Bytes::new(),
            };
        }
    }
    let (start, len) = effective_window(spec);
    let mut mem = memory.lock().unwrap();
    let image = mem
        .entry((spec.area as u8, spec.db))
        .or_insert_with(|| vec![0u8; 0x10000]);
    let data = Bytes::copy_from_slice(&image[start..start + len]);
    ReadResultItem {
        return_code: ReturnCode::DataOk,
        transport: match spec.transport {
            Transport::Counter | Transport::Timer => DataTransport::OctetString,
            _ => DataTransport::ByteWordDWord,
        },
        data,
    }
}

fn write_one(
    spec: &VarSpec,
    data: &[u8],
    memory: &Arc<Mutex<HashMap<(u8, u16), Vec<u8>>>>,
) -> ReturnCode {
    let mut mem = memory.lock().unwrap();
    let image = mem
        .entry((spec.area as u8, spec.db))
        .or_insert_with(|| vec![0u8; 0x10000]);
    match spec.transport {
        Transport::Bit => {
            if data.is_empty() {
                return ReturnCode::InvalidAddress;
            }
            let byte = spec.byte_offset as usize;
            let mask = 1u8 << spec.bit_offset;
            if data[0] & 1 != 0 {
                image[byte] |= mask;
            } else {
                image[byte] &= !mask;
            }
        }
        _ => {
            let (start, _) = effective_window(spec);
            if start + data.len() > image.len() {
                return ReturnCode::InvalidAddress;
            }
            image[start..start + data.len()].copy_from_slice(data);
        }
    }
    ReturnCode::DataOk
}

fn user_data_response(
    pdu_ref: u16,
    ud: &s7link::protocol::frame::UserDataParam,
    pdu: &S7Pdu,
    config: &MockConfig,
    state: &mut MockState,
) -> BytesMut {
    let group = ud.group as u8;
    let key = (group, ud.subfunction);

    // Clock services keep live state; everything else is table-driven.
    let segments: Vec<Bytes> = if ud.group == FunctionGroup::TimeFunctions {
        match ud.subfunction {
            0x01 => {
                let raw = if state.clock_raw.is_empty() {
                    // 2020-01-01 00:00:00, BCD with century byte.
                    vec![0x00, 0x20, 0x20, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03]
                } else {
                    state.clock_raw.clone()
                };
                vec![Bytes::from(raw)]
            }
            0x04 => {
                if let Ok(PayloadRef::UserData(item)) =
                    parse_payload(&ParamRef::UserData(*ud), &pdu.data)
                {
                    state.clock_raw = item.data.to_vec();
                }
                vec![Bytes::new()]
            }
            _ => Vec::new(),
        }
    } else if ud.method == 0x12 && !state.segments.contains_key(&key) {
        Vec::new()
    } else if let Some(pending) = state.segments.remove(&key) {
        pending
    } else {
        config.user_data.get(&key).cloned().unwrap_or_default()
    };

    if segments.is_empty() {
        // Service not implemented.
        let head = UserDataResponseHead {
            data_unit_ref: 0,
            last_data_unit: true,
            error: 0x8104,
        };
        let mut frame =
            build_user_data_response(ud.group, ud.subfunction, ud.sequence, head, Bytes::new());
        frame[PDU_REF_OFFSET..PDU_REF_OFFSET + 2].copy_from_slice(&pdu_ref.to_be_bytes());
        return frame;
    }

    let (first, rest) = segments.split_first().unwrap();
    let last = rest.is_empty();
    let head = UserDataResponseHead {
        data_unit_ref: if last { 0 } else { 1 },
        last_data_unit: last,
        error: 0,
    };
    if !last {
        state.segments.insert(key, rest.to_vec());
    }
    let mut frame =
        build_user_data_response(ud.group, ud.subfunction, ud.sequence, head, first.clone());
    frame[PDU_REF_OFFSET..PDU_REF_OFFSET + 2].copy_from_slice(&pdu_ref.to_be_bytes());
    frame
}
