//! The endpoint: connection lifecycle above the S7 session. Owns the
//! transport factory, schedules reconnection, fans out lifecycle events and
//! provides the area-level read/write and diagnostic services.

use crate::protocol::error::{Error, Result};
use crate::protocol::frame::iter::VarSpec;
use crate::protocol::frame::owned::WriteDataItem;
use crate::protocol::frame::tsap::{dst_tsap_for, DEFAULT_SRC_TSAP};
use crate::protocol::frame::types::{
    BlockType, MemoryArea, Transport, SSL_ID_AVAILABLE, SSL_ID_COMPONENT_IDENT,
    SSL_ID_MODULE_IDENT, SUB_CPU_READ_SZL,
};
use crate::protocol::planner::PlannerConfig;
use crate::protocol::session::{
    BlockListEntry, ConnectionState, Duplex, S7Connection, SessionConfig,
};
use arc_swap::ArcSwapOption;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Endpoint configuration. Every field has a default so partial
/// deserialization works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOptions {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    /// Override the derived source TSAP.
    pub src_tsap: Option<u16>,
    /// Override the destination TSAP derived from rack/slot.
    pub dst_tsap: Option<u16>,
    /// Milliseconds between reconnect attempts; 0 disables reconnection.
    pub auto_reconnect_ms: u64,
    pub max_jobs: u16,
    pub max_pdu_size: u16,
    /// Per-job deadline in milliseconds.
    pub timeout_ms: u64,
    pub skip_optimization: bool,
    /// Coalesce gap for grouped reads, in bytes.
    pub optimization_gap: usize,
    pub connect_timeout_ms: u64,
    pub tcp_nodelay: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 102,
            rack: 0,
            slot: 2,
            src_tsap: None,
            dst_tsap: None,
            auto_reconnect_ms: 5000,
            max_jobs: 8,
            max_pdu_size: 480,
            timeout_ms: 2000,
            skip_optimization: false,
            optimization_gap: 5,
            connect_timeout_ms: 10_000,
            tcp_nodelay: true,
        }
    }
}

/// Lifecycle and diagnostic events broadcast by the endpoint. Delivery is
/// ordered within a session; nothing is replayed across reconnects.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Connecting,
    Connected,
    Disconnected,
    /// Negotiated PDU size; re-emitted on every successful (re)connect even
    /// when the value is unchanged.
    PduSize(u16),
    /// Non-fatal error; reconnection (when configured) is already scheduled.
    Error(String),
}

/// Factory producing connected transports, used to inject something other
/// than the default ISO-on-TCP client.
pub type TransportFactory =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<Box<dyn Duplex>>> + Send + Sync>;

/// Parsed System Status List response. The raw envelope is preserved next to
/// the per-entry slices because some controllers use vendor-specific entry
/// encodings.
#[derive(Debug, Clone)]
pub struct SslResponse {
    pub id: u16,
    pub index: u16,
    pub entry_len: u16,
    pub count: u16,
    pub raw: Bytes,
    pub entries: Vec<Bytes>,
}

/// One SSL 0x0011 entry. Version words are intentionally left raw.
#[derive(Debug, Clone)]
pub struct ModuleIdent {
    pub index: u16,
    pub order_number: String,
    pub raw: Bytes,
}

/// One SSL 0x001C entry.
#[derive(Debug, Clone)]
pub struct ComponentIdent {
    pub index: u16,
    pub value: String,
    pub raw: Bytes,
}

pub struct S7Endpoint {
    opts: EndpointOptions,
    factory: Option<TransportFactory>,
    conn: ArcSwapOption<S7Connection>,
    events_tx: broadcast::Sender<EndpointEvent>,
    pdu_tx: watch::Sender<u16>,
    pdu_rx: watch::Receiver<u16>,
    supervisor: Mutex<Option<CancellationToken>>,
}

impl S7Endpoint {
    pub fn new(opts: EndpointOptions) -> Arc<Self> {
        Self::with_transport(opts, None)
    }

    /// Endpoint with an injected transport factory instead of the default
    /// ISO-on-TCP client.
    pub fn with_transport(opts: EndpointOptions, factory: Option<TransportFactory>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let (pdu_tx, pdu_rx) = watch::channel(0u16);
        Arc::new(S7Endpoint {
            opts,
            factory,
            conn: ArcSwapOption::from(None),
            events_tx,
            pdu_tx,
            pdu_rx,
            supervisor: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.opts
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events_tx.subscribe()
    }

    /// Watch channel carrying the negotiated PDU size (0 while disconnected).
    pub fn pdu_size_watch(&self) -> watch::Receiver<u16> {
        self.pdu_rx.clone()
    }

    #[inline]
    pub fn pdu_size(&self) -> u16 {
        *self.pdu_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    /// The active connection, or `ErrNotConnected`.
    pub fn connection(&self) -> Result<Arc<S7Connection>> {
        match self.conn.load_full() {
            Some(c) if c.state() == ConnectionState::Connected => Ok(c),
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) fn planner_config(&self, pdu_size: u16) -> PlannerConfig {
        PlannerConfig {
            pdu_size,
            optimization_gap: self.opts.optimization_gap,
            skip_optimization: self.opts.skip_optimization,
        }
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events_tx.send(event);
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let dst_tsap = match self.opts.dst_tsap {
            Some(tsap) => tsap,
            None => dst_tsap_for(self.opts.rack, self.opts.slot)?,
        };
        Ok(SessionConfig {
            src_tsap: self.opts.src_tsap.unwrap_or(DEFAULT_SRC_TSAP),
            dst_tsap,
            max_pdu_size: self.opts.max_pdu_size,
            max_jobs: self.opts.max_jobs,
            timeout: Duration::from_millis(self.opts.timeout_ms),
            ..SessionConfig::default()
        })
    }

    async fn dial(&self) -> Result<Box<dyn Duplex>> {
        if let Some(factory) = &self.factory {
            return factory().await.map_err(Error::Io);
        }
        let connect = TcpStream::connect((self.opts.host.as_str(), self.opts.port));
        let stream = timeout(Duration::from_millis(self.opts.connect_timeout_ms), connect)
            .await
            .map_err(|_| Error::Timeout)??;
        let _ = stream.set_nodelay(self.opts.tcp_nodelay);
        Ok(Box::new(stream))
    }

    async fn establish(&self) -> Result<()> {
        let stream = self.dial().await?;
        let conn = S7Connection::open(stream, self.session_config()?).await?;
        let pdu_size = conn.pdu_size();
        self.conn.store(Some(conn));
        let _ = self.pdu_tx.send(pdu_size);
        self.emit(EndpointEvent::Connected);
        self.emit(EndpointEvent::PduSize(pdu_size));
        Ok(())
    }

    /// Connect and settle. Idempotent: returns immediately when already
    /// connected. On failure with reconnection configured, the retry loop is
    /// scheduled before the error returns.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let token = self.replace_supervisor();
        self.emit(EndpointEvent::Connecting);
        let result = self.establish().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "s7 endpoint connect failed");
            self.emit(EndpointEvent::Error(e.to_string()));
        }
        if result.is_ok() || self.opts.auto_reconnect_ms > 0 {
            let me = Arc::clone(self);
            tokio::spawn(async move { me.supervise(token).await });
        }
        result
    }

    /// Disconnect and settle. Idempotent. Fails every outstanding job with
    /// `ErrInterrupted` and stops any scheduled reconnection.
    pub async fn disconnect(&self) {
        self.cancel_supervisor();
        if let Some(conn) = self.conn.swap(None) {
            conn.shutdown().await;
            let _ = self.pdu_tx.send(0);
            self.emit(EndpointEvent::Disconnected);
        }
    }

    fn replace_supervisor(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.supervisor.lock().expect("supervisor lock");
        if let Some(old) = guard.replace(token.clone()) {
            old.cancel();
        }
        token
    }

    fn cancel_supervisor(&self) {
        if let Some(token) = self.supervisor.lock().expect("supervisor lock").take() {
            token.cancel();
        }
    }

    /// Watch the active connection and, when reconnection is configured,
    /// re-establish after the configured delay until cancelled.
    async fn supervise(self: Arc<Self>, token: CancellationToken) {
        loop {
            if let Some(conn) = self.conn.load_full() {
                let mut state_rx = conn.state_watch();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = state_rx.wait_for(|s| matches!(s, ConnectionState::Disconnected)) => {
                        self.conn.store(None);
                        let _ = self.pdu_tx.send(0);
                        self.emit(EndpointEvent::Disconnected);
                    }
                }
            }
            if self.opts.auto_reconnect_ms == 0 {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(Duration::from_millis(self.opts.auto_reconnect_ms)) => {}
            }
            self.emit(EndpointEvent::Connecting);
            if let Err(e) = self.establish().await {
                tracing::warn!(error = %e, "s7 endpoint reconnect failed");
                self.emit(EndpointEvent::Error(e.to_string()));
            }
        }
    }

    /// Read a contiguous window from a memory area, splitting the request
    /// across as many ReadVar jobs as the PDU limit requires.
    pub async fn read_area(
        &self,
        area: MemoryArea,
        db: u16,
        start: u32,
        len: usize,
    ) -> Result<Bytes> {
        let conn = self.connection()?;
        let max_slice = (conn.pdu_size() as usize).saturating_sub(18);
        let mut out = BytesMut::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let slice = (len - offset).min(max_slice);
            let spec = VarSpec {
                transport: Transport::Byte,
                count: slice as u16,
                db,
                area,
                byte_offset: start + offset as u32,
                bit_offset: 0,
            };
            let mut results = conn.request_read_vars(vec![spec]).await?;
            let result = results.pop().ok_or(Error::unexpected("empty read result"))?;
            if !result.code.is_ok() {
                return Err(Error::ReturnCode {
                    code: result.code,
                    context: format!(
                        "area {area:?} db {db} bytes {}..{}",
                        start + offset as u32,
                        start + (offset + slice) as u32
                    ),
                });
            }
            out.put_slice(&result.data);
            offset += slice;
        }
        Ok(out.freeze())
    }

    /// Write a contiguous window to a memory area, splitting across the PDU
    /// limit. Any non-OK slice fails the whole call.
    pub async fn write_area(
        &self,
        area: MemoryArea,
        db: u16,
        start: u32,
        buf: &[u8],
    ) -> Result<()> {
        let conn = self.connection()?;
        let max_slice = (conn.pdu_size() as usize).saturating_sub(28);
        let mut offset = 0usize;
        while offset < buf.len() {
            let slice = (buf.len() - offset).min(max_slice);
            let spec = VarSpec {
                transport: Transport::Byte,
                count: slice as u16,
                db,
                area,
                byte_offset: start + offset as u32,
                bit_offset: 0,
            };
            let item = WriteDataItem {
                transport: Transport::Byte,
                data: Bytes::copy_from_slice(&buf[offset..offset + slice]),
            };
            let codes = conn.request_write_vars(vec![spec], vec![item]).await?;
            let code = codes.first().copied().ok_or(Error::unexpected("empty write result"))?;
            if !code.is_ok() {
                return Err(Error::ReturnCode {
                    code,
                    context: format!(
                        "area {area:?} db {db} bytes {}..{}",
                        start + offset as u32,
                        start + (offset + slice) as u32
                    ),
                });
            }
            offset += slice;
        }
        Ok(())
    }

    pub async fn read_db(&self, db: u16, start: u32, len: usize) -> Result<Bytes> {
        self.read_area(MemoryArea::Db, db, start, len).await
    }

    pub async fn write_db(&self, db: u16, start: u32, buf: &[u8]) -> Result<()> {
        self.write_area(MemoryArea::Db, db, start, buf).await
    }

    pub async fn read_flags(&self, start: u32, len: usize) -> Result<Bytes> {
        self.read_area(MemoryArea::Flags, 0, start, len).await
    }

    pub async fn write_flags(&self, start: u32, buf: &[u8]) -> Result<()> {
        self.write_area(MemoryArea::Flags, 0, start, buf).await
    }

    pub async fn read_inputs(&self, start: u32, len: usize) -> Result<Bytes> {
        self.read_area(MemoryArea::Inputs, 0, start, len).await
    }

    pub async fn read_outputs(&self, start: u32, len: usize) -> Result<Bytes> {
        self.read_area(MemoryArea::Outputs, 0, start, len).await
    }

    /// Read one System Status List and parse its envelope.
    pub async fn get_ssl(&self, id: u16, index: u16) -> Result<SslResponse> {
        let conn = self.connection()?;
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u16(id);
        payload.put_u16(index);
        let raw = conn
            .send_user_data(
                crate::protocol::frame::types::FunctionGroup::CpuFunctions,
                SUB_CPU_READ_SZL,
                payload.freeze(),
            )
            .await?;
        if raw.len() < 8 {
            return Err(Error::unexpected("short SSL envelope"));
        }
        let resp_id = u16::from_be_bytes([raw[0], raw[1]]);
        let resp_index = u16::from_be_bytes([raw[2], raw[3]]);
        let entry_len = u16::from_be_bytes([raw[4], raw[5]]);
        let count = u16::from_be_bytes([raw[6], raw[7]]);
        let mut entries = Vec::with_capacity(count as usize);
        if entry_len > 0 {
            let body = &raw[8..];
            for i in 0..count as usize {
                let begin = i * entry_len as usize;
                let end = begin + entry_len as usize;
                if end > body.len() {
                    break;
                }
                entries.push(raw.slice(8 + begin..8 + end));
            }
        }
        Ok(SslResponse {
            id: resp_id,
            index: resp_index,
            entry_len,
            count,
            raw,
            entries,
        })
    }

    /// Ids of the SSLs this controller exposes (SSL 0x0000).
    pub async fn get_available_ssl(&self) -> Result<Vec<u16>> {
        let ssl = self.get_ssl(SSL_ID_AVAILABLE, 0x0000).await?;
        Ok(ssl
            .entries
            .iter()
            .filter(|e| e.len() >= 2)
            .map(|e| u16::from_be_bytes([e[0], e[1]]))
            .collect())
    }

    /// Module identification (SSL 0x0011).
    pub async fn get_module_identification(&self) -> Result<Vec<ModuleIdent>> {
        let ssl = self.get_ssl(SSL_ID_MODULE_IDENT, 0x0000).await?;
        Ok(ssl
            .entries
            .iter()
            .filter(|e| e.len() >= 2)
            .map(|e| ModuleIdent {
                index: u16::from_be_bytes([e[0], e[1]]),
                order_number: ascii_field(&e[2..e.len().min(22)]),
                raw: e.clone(),
            })
            .collect())
    }

    /// Component identification (SSL 0x001C).
    pub async fn get_component_identification(&self) -> Result<Vec<ComponentIdent>> {
        let ssl = self.get_ssl(SSL_ID_COMPONENT_IDENT, 0x0000).await?;
        Ok(ssl
            .entries
            .iter()
            .filter(|e| e.len() >= 2)
            .map(|e| ComponentIdent {
                index: u16::from_be_bytes([e[0], e[1]]),
                value: ascii_field(&e[2..]),
                raw: e.clone(),
            })
            .collect())
    }

    pub async fn block_count(&self) -> Result<HashMap<BlockType, u16>> {
        self.connection()?.block_count().await
    }

    pub async fn list_blocks(&self, ty: BlockType) -> Result<Vec<BlockListEntry>> {
        self.connection()?.list_blocks(ty).await
    }

    pub async fn get_block_info(
        &self,
        ty: BlockType,
        number: u16,
        filesystem: char,
    ) -> Result<Bytes> {
        self.connection()?
            .get_block_info(ty, number, filesystem)
            .await
    }

    pub async fn upload_block(&self, filename: &str) -> Result<Bytes> {
        self.connection()?.upload_block(filename).await
    }

    pub async fn get_time(&self) -> Result<NaiveDateTime> {
        self.connection()?.get_time().await
    }

    pub async fn set_time(&self, dt: NaiveDateTime) -> Result<()> {
        self.connection()?.set_time(dt).await
    }
}

impl Drop for S7Endpoint {
    fn drop(&mut self) {
        self.cancel_supervisor();
        if let Some(conn) = self.conn.swap(None) {
            drop(conn); // connection Drop cancels its IO driver
        }
    }
}

/// Trim an ascii field: stop at NUL, drop trailing spaces.
fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string()
}
