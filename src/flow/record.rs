use chrono::{DateTime, TimeDelta, Utc};

use super::key::{Endpoint, FlowKey};

/// Why a flow left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// TCP FIN or RST observed.
    TcpClose,
    IdleTimeout,
    LifetimeExceeded,
    /// Forced out by the final drain of a session.
    EndOfCapture,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::TcpClose => "tcp_close",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::LifetimeExceeded => "lifetime_exceeded",
            EndReason::EndOfCapture => "end_of_capture",
        }
    }
}

/// Final snapshot of a drained flow.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFlow {
    /// Creation sequence number within the session.
    pub id: u64,
    pub key: FlowKey,
    pub originator: Endpoint,
    pub responder: Endpoint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub fwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_packets: u64,
    pub bwd_bytes: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    /// `last_seen - first_seen`. Never negative when built by the table.
    pub duration: TimeDelta,
    pub end_reason: EndReason,
}

impl CompletedFlow {
    pub fn total_bytes(&self) -> u64 {
        self.fwd_bytes + self.bwd_bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd_packets + self.bwd_packets
    }
}
