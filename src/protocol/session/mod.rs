//! The S7 connection: a full-duplex request/response multiplexer over a
//! framed transport. One IO driver task owns the socket, the job table and
//! the deadline wheel; callers interact through a bounded FIFO queue guarded
//! by the negotiated concurrency window.

mod handshake;
mod state;

pub use state::{ConnectionState, Negotiated, SessionConfig, PDU_SIZE_CEILING};

use super::codec::Codec;
use super::error::{Error, Result};
use super::frame::{
    wire::WireDecode,
    builder::{
        build_end_upload, build_read_var, build_start_upload, build_upload, build_user_data_continue,
        build_user_data_request, build_write_var,
    },
    comm::PDU_REF_OFFSET,
    iter::VarSpec,
    owned::WriteDataItem,
    types::{
        decode_datetime8, dec_to_bcd, encode_datetime8, BlockType, DataTransport, FunctionGroup,
        ReturnCode, SUB_BLOCK_COUNT, SUB_BLOCK_INFO, SUB_BLOCK_LIST, SUB_CLOCK_READ, SUB_CLOCK_SET,
    },
    Cotp, ParamRef, PayloadRef, S7AppBody, S7Message, S7Pdu,
};
use bytes::{Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime};
use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Byte-stream transport the connection runs over. Anything duplex works:
/// `TcpStream` in production, `tokio::io::duplex` halves in tests.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// One queued job: serialized frame (reference patched on admission), the
/// completion channel and the RAII window permit.
struct JobRequest {
    frame: BytesMut,
    timeout: Duration,
    response_tx: oneshot::Sender<Result<S7Pdu>>,
    permit: OwnedSemaphorePermit,
}

/// Entry for each in-flight job. Dropping it releases the window slot.
struct InflightEntry {
    tx: oneshot::Sender<Result<S7Pdu>>,
    _permit: OwnedSemaphorePermit,
}

/// One item result of a grouped read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub code: ReturnCode,
    pub transport: DataTransport,
    pub data: Bytes,
}

/// One entry of a block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockListEntry {
    pub number: u16,
    pub flags: u8,
    pub language: u8,
}

/// An established S7 connection. Created by [`S7Connection::open`] once the
/// COTP and Setup Communication handshakes have completed.
pub struct S7Connection {
    config: SessionConfig,
    negotiated: Negotiated,
    request_tx: mpsc::Sender<JobRequest>,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ConnectionState>,
    inflight_gauge: Arc<AtomicUsize>,
}

impl std::fmt::Debug for S7Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S7Connection")
            .field("negotiated", &self.negotiated)
            .field("state", &self.state())
            .finish()
    }
}

impl S7Connection {
    /// Handshake on a connected transport and spawn the IO driver.
    pub async fn open(stream: Box<dyn Duplex>, config: SessionConfig) -> Result<Arc<Self>> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let mut framed = Framed::new(stream, Codec);

        handshake::iso_connect(&mut framed, &config).await?;
        let negotiated = handshake::negotiate(&mut framed, &config).await?;
        tracing::debug!(
            pdu_size = negotiated.pdu_size,
            max_jobs = negotiated.max_jobs,
            "s7 connection established"
        );

        let (request_tx, request_rx) = mpsc::channel(config.queue_capacity);
        let window = Arc::new(Semaphore::new(negotiated.max_jobs));
        let cancel = CancellationToken::new();
        let inflight_gauge = Arc::new(AtomicUsize::new(0));

        let _ = state_tx.send(ConnectionState::Connected);
        tokio::spawn(run_io(
            framed,
            request_rx,
            cancel.clone(),
            state_tx,
            Arc::clone(&window),
            Arc::clone(&inflight_gauge),
        ));

        Ok(Arc::new(S7Connection {
            config,
            negotiated,
            request_tx,
            window,
            cancel,
            state_rx,
            inflight_gauge,
        }))
    }

    /// Negotiated PDU size.
    #[inline]
    pub fn pdu_size(&self) -> u16 {
        self.negotiated.pdu_size
    }

    /// Effective concurrency window.
    #[inline]
    pub fn max_jobs(&self) -> usize {
        self.negotiated.max_jobs
    }

    /// Current number of in-flight jobs.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight_gauge.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Tear the connection down, failing every outstanding and queued job.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s, ConnectionState::Disconnected))
            .await;
    }

    /// Enqueue one serialized job and await its matching response.
    async fn send_job(&self, frame: BytesMut) -> Result<S7Pdu> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let permit = Arc::clone(&self.window)
            .acquire_owned()
            .await
            .map_err(|_| Error::Interrupted)?;
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(JobRequest {
                frame,
                timeout: self.config.timeout,
                response_tx: tx,
                permit,
            })
            .await
            .map_err(|_| Error::Interrupted)?;
        rx.await.map_err(|_| Error::Interrupted)?
    }

    /// One ReadVar job. Returns per-part results parallel to `specs`.
    pub async fn request_read_vars(&self, specs: Vec<VarSpec>) -> Result<Vec<ReadResult>> {
        let expected = specs.len();
        let pdu = self.send_job(build_read_var(specs)).await?;
        pdu.check_error()?;
        let (param, payload) = pdu.view()?;
        let item_count = match param {
            ParamRef::AckReadVar { item_count } => item_count as usize,
            _ => return Err(Error::unexpected("expected ReadVar AckData")),
        };
        if item_count != expected {
            return Err(Error::unexpected("item count mismatch in read response"));
        }
        let iter = payload
            .iter_data_items()
            .ok_or(Error::unexpected("missing read response payload"))?;
        let mut out = Vec::with_capacity(item_count);
        for item in iter {
            let item = item?;
            out.push(ReadResult {
                code: item.return_code,
                transport: item.transport,
                data: Bytes::slice_ref(&pdu.data, item.data),
            });
        }
        if out.len() != expected {
            return Err(Error::unexpected("short read response payload"));
        }
        Ok(out)
    }

    /// One WriteVar job. Returns per-item return codes parallel to `specs`.
    pub async fn request_write_vars(
        &self,
        specs: Vec<VarSpec>,
        items: Vec<WriteDataItem>,
    ) -> Result<Vec<ReturnCode>> {
        let expected = specs.len();
        if items.len() != expected {
            return Err(Error::InvalidArgument(
                "write specs and data items must be parallel".into(),
            ));
        }
        let pdu = self.send_job(build_write_var(specs, items)).await?;
        pdu.check_error()?;
        let (param, payload) = pdu.view()?;
        let item_count = match param {
            ParamRef::AckWriteVar { item_count } => item_count as usize,
            _ => return Err(Error::unexpected("expected WriteVar AckData")),
        };
        if item_count != expected {
            return Err(Error::unexpected("item count mismatch in write response"));
        }
        let iter = payload
            .iter_status_items()
            .ok_or(Error::unexpected("missing write response payload"))?;
        iter.collect()
    }

    /// One user-data exchange, following data-unit continuations until the
    /// last-data-unit flag; returns the concatenated data portion.
    pub async fn send_user_data(
        &self,
        group: FunctionGroup,
        subfunction: u8,
        payload: Bytes,
    ) -> Result<Bytes> {
        let mut acc = BytesMut::new();
        let mut frame = build_user_data_request(group, subfunction, 0, payload);
        loop {
            let pdu = self.send_job(frame).await?;
            let (param, pl) = pdu.view()?;
            let ud = match param {
                ParamRef::UserData(ud) => ud,
                _ => return Err(Error::unexpected("expected user-data response")),
            };
            let head = ud
                .response
                .ok_or(Error::unexpected("user-data response without header"))?;
            if head.error != 0 {
                return Err(Error::Plc {
                    class: (head.error >> 8) as u8,
                    code: (head.error & 0xFF) as u8,
                });
            }
            match pl {
                PayloadRef::UserData(item) => {
                    if !item.return_code.is_ok() && !matches!(item.return_code, ReturnCode::ObjectNotFound)
                    {
                        return Err(Error::ReturnCode {
                            code: item.return_code,
                            context: format!("user data {group:?} subfunction 0x{subfunction:02X}"),
                        });
                    }
                    acc.extend_from_slice(item.data);
                }
                PayloadRef::Empty => {}
                _ => return Err(Error::unexpected("unexpected user-data payload shape")),
            }
            if head.last_data_unit {
                break;
            }
            frame = build_user_data_continue(group, subfunction, head.data_unit_ref);
        }
        Ok(acc.freeze())
    }

    /// Count program blocks per type.
    pub async fn block_count(&self) -> Result<HashMap<BlockType, u16>> {
        let data = self
            .send_user_data(FunctionGroup::BlockFunctions, SUB_BLOCK_COUNT, Bytes::new())
            .await?;
        let mut out = HashMap::new();
        for entry in data.chunks_exact(4) {
            let ty = u16::from_be_bytes([entry[0], entry[1]]);
            let count = u16::from_be_bytes([entry[2], entry[3]]);
            if let Some(bt) = BlockType::from_code((ty & 0xFF) as u8) {
                out.insert(bt, count);
            }
        }
        Ok(out)
    }

    /// List blocks of one type: number, flags and language per entry.
    pub async fn list_blocks(&self, ty: BlockType) -> Result<Vec<BlockListEntry>> {
        let data = self
            .send_user_data(
                FunctionGroup::BlockFunctions,
                SUB_BLOCK_LIST,
                Bytes::copy_from_slice(&ty.ascii_pair()),
            )
            .await?;
        Ok(data
            .chunks_exact(4)
            .map(|entry| BlockListEntry {
                number: u16::from_be_bytes([entry[0], entry[1]]),
                flags: entry[2],
                language: entry[3],
            })
            .collect())
    }

    /// Raw block header information for one block.
    pub async fn get_block_info(
        &self,
        ty: BlockType,
        number: u16,
        filesystem: char,
    ) -> Result<Bytes> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&ty.ascii_pair());
        payload.extend_from_slice(format!("{number:05}").as_bytes());
        payload.push(filesystem as u8);
        self.send_user_data(
            FunctionGroup::BlockFunctions,
            SUB_BLOCK_INFO,
            Bytes::from(payload),
        )
        .await
    }

    /// Upload a block file via the Start Upload / Upload / End Upload
    /// handshake. Any intermediate failure aborts the upload id before the
    /// error propagates.
    pub async fn upload_block(&self, filename: &str) -> Result<Bytes> {
        let pdu = self
            .send_job(build_start_upload(filename.as_bytes().to_vec()))
            .await?;
        pdu.check_error()?;
        let upload_id = match pdu.view()? {
            (ParamRef::AckStartUpload(ack), _) => ack.upload_id,
            _ => return Err(Error::unexpected("expected start upload AckData")),
        };

        let mut out = BytesMut::new();
        loop {
            let step = async {
                let pdu = self.send_job(build_upload(upload_id)).await?;
                pdu.check_error()?;
                match pdu.view()? {
                    (ParamRef::AckUpload(ack), PayloadRef::UploadChunk(chunk)) => {
                        Ok::<_, Error>((ack.more_follows, Bytes::copy_from_slice(chunk)))
                    }
                    _ => Err(Error::unexpected("expected upload chunk AckData")),
                }
            };
            match step.await {
                Ok((more, chunk)) => {
                    out.extend_from_slice(&chunk);
                    if !more {
                        break;
                    }
                }
                Err(e) => {
                    // Abort the upload id; the original error wins.
                    let _ = self.send_job(build_end_upload(upload_id)).await;
                    return Err(e);
                }
            }
        }

        let pdu = self.send_job(build_end_upload(upload_id)).await?;
        pdu.check_error()?;
        Ok(out.freeze())
    }

    /// Read the controller clock.
    pub async fn get_time(&self) -> Result<NaiveDateTime> {
        let data = self
            .send_user_data(FunctionGroup::TimeFunctions, SUB_CLOCK_READ, Bytes::new())
            .await?;
        if data.len() < 10 {
            return Err(Error::unexpected("short clock response"));
        }
        decode_datetime8(&data[2..10]).ok_or(Error::unexpected("invalid clock encoding"))
    }

    /// Set the controller clock.
    pub async fn set_time(&self, dt: NaiveDateTime) -> Result<()> {
        let mut payload = Vec::with_capacity(10);
        payload.push(0x00);
        payload.push(dec_to_bcd((dt.year() / 100) as u8));
        payload.extend_from_slice(&encode_datetime8(&dt));
        self.send_user_data(
            FunctionGroup::TimeFunctions,
            SUB_CLOCK_SET,
            Bytes::from(payload),
        )
        .await?;
        Ok(())
    }
}

impl Drop for S7Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type FramedSink = SplitSink<Framed<Box<dyn Duplex>, Codec>, S7Message>;
type FramedStream = SplitStream<Framed<Box<dyn Duplex>, Codec>>;

/// The IO driver: sole owner of the transport, the job table, the deadline
/// wheel and the reference allocator.
async fn run_io(
    framed: Framed<Box<dyn Duplex>, Codec>,
    mut request_rx: mpsc::Receiver<JobRequest>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    window: Arc<Semaphore>,
    inflight_gauge: Arc<AtomicUsize>,
) {
    let (mut sink, mut stream) = framed.split();
    let mut inflight: HashMap<u16, InflightEntry> = HashMap::with_capacity(16);
    let mut deadlines: BTreeMap<Instant, Vec<u16>> = BTreeMap::new();
    let mut reassembly: Option<BytesMut> = None;
    // Reference 1 went to Setup Communication during the handshake.
    let mut next_ref: u16 = 2;
    // Reusable sleep, reset to the nearest deadline each turn.
    let far_future = Duration::from_secs(3600);
    let mut deadline_sleep = Box::pin(sleep(far_future));

    loop {
        match deadlines.keys().next() {
            Some(dl) => deadline_sleep.as_mut().reset(*dl),
            None => deadline_sleep.as_mut().reset(Instant::now() + far_future),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            req = request_rx.recv() => match req {
                Some(job) => {
                    if !admit_job(
                        job,
                        &mut next_ref,
                        &mut inflight,
                        &mut deadlines,
                        &inflight_gauge,
                        &mut sink,
                    )
                    .await
                    {
                        break;
                    }
                }
                None => break,
            },
            msg = poll_next(&mut stream) => match msg {
                Some(Ok(m)) => handle_message(m, &mut reassembly, &mut inflight, &inflight_gauge),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "s7 transport error");
                    break;
                }
                None => break,
            },
            _ = &mut deadline_sleep => {
                if expire_deadlines(&mut deadlines, &mut inflight, &inflight_gauge) {
                    // A stuck job poisons the multiplexer: the controller has
                    // no out-of-band cancel, so the stream is unusable.
                    break;
                }
            }
        }
    }

    let _ = state_tx.send(ConnectionState::Disconnecting);
    window.close();
    request_rx.close();
    // Fail everything still queued or outstanding.
    while let Ok(job) = request_rx.try_recv() {
        let _ = job.response_tx.send(Err(Error::Interrupted));
    }
    for (_, entry) in inflight.drain() {
        let _ = entry.tx.send(Err(Error::Interrupted));
    }
    inflight_gauge.store(0, Ordering::Relaxed);
    let _ = state_tx.send(ConnectionState::Disconnected);
}

/// Assign a reference, patch the frame, register the job and transmit.
/// Returns false when the transport is gone.
async fn admit_job(
    mut job: JobRequest,
    next_ref: &mut u16,
    inflight: &mut HashMap<u16, InflightEntry>,
    deadlines: &mut BTreeMap<Instant, Vec<u16>>,
    inflight_gauge: &AtomicUsize,
    sink: &mut FramedSink,
) -> bool {
    if job.frame.len() < PDU_REF_OFFSET + 2 {
        let _ = job.response_tx.send(Err(Error::unexpected("runt job frame")));
        return true;
    }
    let pdu_ref = alloc_ref(next_ref, inflight);
    job.frame[PDU_REF_OFFSET..PDU_REF_OFFSET + 2].copy_from_slice(&pdu_ref.to_be_bytes());

    let deadline = Instant::now() + job.timeout;
    inflight.insert(
        pdu_ref,
        InflightEntry {
            tx: job.response_tx,
            _permit: job.permit,
        },
    );
    inflight_gauge.fetch_add(1, Ordering::Relaxed);
    deadlines.entry(deadline).or_default().push(pdu_ref);

    if let Err(e) = sink.send(S7Message::data(job.frame.freeze())).await {
        if let Some(entry) = inflight.remove(&pdu_ref) {
            let _ = entry.tx.send(Err(Error::Io(e)));
            inflight_gauge.fetch_sub(1, Ordering::Relaxed);
        }
        return false;
    }
    true
}

/// Monotonic 16-bit reference starting at 1, skipping 0 and any reference
/// still outstanding.
fn alloc_ref(next_ref: &mut u16, inflight: &HashMap<u16, InflightEntry>) -> u16 {
    loop {
        let candidate = *next_ref;
        *next_ref = match next_ref.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        if candidate != 0 && !inflight.contains_key(&candidate) {
            return candidate;
        }
    }
}

/// Demultiplex one received wire message, reassembling COTP segments.
fn handle_message(
    msg: S7Message,
    reassembly: &mut Option<BytesMut>,
    inflight: &mut HashMap<u16, InflightEntry>,
    inflight_gauge: &AtomicUsize,
) {
    let eot = match &msg.cotp {
        Cotp::Dt(params) => params.eot,
        _ => return,
    };
    let body = match msg.app {
        Some(S7AppBody::Parsed(pdu)) => {
            if reassembly.is_none() {
                complete(pdu, inflight, inflight_gauge);
                return;
            }
            // A reassembly is active: fold the raw bytes back in.
            pdu.to_bytes_mut().freeze()
        }
        Some(S7AppBody::Segment(bytes)) => bytes,
        None => return,
    };

    if !eot {
        reassembly
            .get_or_insert_with(|| BytesMut::with_capacity(body.len() * 2))
            .extend_from_slice(&body);
        return;
    }

    let full = match reassembly.take() {
        Some(mut buf) => {
            buf.extend_from_slice(&body);
            buf.freeze()
        }
        None => body,
    };
    match S7Pdu::parse(&full, &full) {
        Ok((_rest, pdu)) => complete(pdu, inflight, inflight_gauge),
        Err(e) => tracing::warn!(error = %e, "dropping unparseable reassembled PDU"),
    }
}

fn complete(pdu: S7Pdu, inflight: &mut HashMap<u16, InflightEntry>, inflight_gauge: &AtomicUsize) {
    let key = pdu.header.pdu_ref;
    if let Some(entry) = inflight.remove(&key) {
        inflight_gauge.fetch_sub(1, Ordering::Relaxed);
        let result = match pdu.check_error() {
            Ok(()) => Ok(pdu),
            Err(e) => Err(e),
        };
        let _ = entry.tx.send(result);
    } else {
        tracing::debug!(pdu_ref = key, "response for unknown reference");
    }
}

/// Fail expired jobs with a timeout. Returns true when at least one expired.
fn expire_deadlines(
    deadlines: &mut BTreeMap<Instant, Vec<u16>>,
    inflight: &mut HashMap<u16, InflightEntry>,
    inflight_gauge: &AtomicUsize,
) -> bool {
    let now = Instant::now();
    let mut expired_any = false;
    let due: Vec<Instant> = deadlines
        .keys()
        .take_while(|dl| **dl <= now)
        .copied()
        .collect();
    for dl in due {
        if let Some(refs) = deadlines.remove(&dl) {
            for key in refs {
                if let Some(entry) = inflight.remove(&key) {
                    inflight_gauge.fetch_sub(1, Ordering::Relaxed);
                    let _ = entry.tx.send(Err(Error::Timeout));
                    expired_any = true;
                }
            }
        }
    }
    expired_any
}

#[inline]
async fn poll_next(stream: &mut FramedStream) -> Option<std::io::Result<S7Message>> {
    stream.next().await
}
