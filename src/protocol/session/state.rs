use std::time::Duration;

/// Connection lifecycle as observed through the state watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Library ceiling for the negotiated PDU size.
pub const PDU_SIZE_CEILING: u16 = 960;

/// Connection-level configuration. The endpoint derives this from its own
/// options; tests construct it directly.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub src_tsap: u16,
    pub dst_tsap: u16,
    /// Our PDU size proposal in Setup Communication.
    pub max_pdu_size: u16,
    /// Local cap on the concurrency window; the negotiated AmQ can shrink it.
    pub max_jobs: u16,
    /// Per-job deadline.
    pub timeout: Duration,
    /// Outbound request queue depth.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            src_tsap: 0x0100,
            dst_tsap: 0x0102,
            max_pdu_size: 480,
            max_jobs: 8,
            timeout: Duration::from_millis(2000),
            queue_capacity: 64,
        }
    }
}

/// Values agreed during Setup Communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub pdu_size: u16,
    pub max_jobs: usize,
}
