//! Completed flows to fixed-schema feature rows.

use chrono::{SecondsFormat, TimeDelta};
use log::warn;
use serde::Serialize;

use crate::flow::CompletedFlow;
use crate::packet::protocol_name;

/// Bump whenever `FEATURE_COLUMNS` changes.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_COLUMNS: [&str; 3] = ["bytes", "packets", "duration"];

/// Model input for one flow. Field order matches `FEATURE_COLUMNS`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureRow {
    pub bytes: u64,
    pub packets: u64,
    /// Seconds.
    #[serde(rename = "duration")]
    pub duration_secs: f64,
}

impl FeatureRow {
    pub fn to_vector(&self) -> [f64; 3] {
        [self.bytes as f64, self.packets as f64, self.duration_secs]
    }
}

#[derive(Debug, Default)]
pub struct FeatureExporter {
    clamped: u64,
}

impl FeatureExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&mut self, flow: &CompletedFlow) -> FeatureRow {
        let duration = if flow.duration < TimeDelta::zero() {
            warn!(
                "Flow {} ({}) has negative duration {}, exporting 0",
                flow.id, flow.key, flow.duration
            );
            self.clamped += 1;
            TimeDelta::zero()
        } else {
            flow.duration
        };

        FeatureRow {
            bytes: flow.total_bytes(),
            packets: flow.total_packets(),
            duration_secs: duration.to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0),
        }
    }

    /// Rows whose duration had to be clamped to zero.
    pub fn clamped_durations(&self) -> u64 {
        self.clamped
    }
}

/// One CSV row of the detailed output: flow identity followed by the features.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub originator_addr: String,
    pub originator_port: u16,
    pub responder_addr: String,
    pub responder_port: u16,
    pub protocol: String,
    pub first_seen: String,
    pub last_seen: String,
    pub fwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_packets: u64,
    pub bwd_bytes: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    pub end_reason: &'static str,
    pub bytes: u64,
    pub packets: u64,
    pub duration: f64,
}

impl FlowReport {
    pub fn new(flow: &CompletedFlow, row: &FeatureRow) -> Self {
        Self {
            originator_addr: flow.originator.addr.to_string(),
            originator_port: flow.originator.port,
            responder_addr: flow.responder.addr.to_string(),
            responder_port: flow.responder.port,
            protocol: protocol_name(flow.key.protocol),
            first_seen: flow.first_seen.to_rfc3339_opts(SecondsFormat::Micros, true),
            last_seen: flow.last_seen.to_rfc3339_opts(SecondsFormat::Micros, true),
            fwd_packets: flow.fwd_packets,
            fwd_bytes: flow.fwd_bytes,
            bwd_packets: flow.bwd_packets,
            bwd_bytes: flow.bwd_bytes,
            syn_count: flow.syn_count,
            fin_count: flow.fin_count,
            rst_count: flow.rst_count,
            end_reason: flow.end_reason.as_str(),
            bytes: row.bytes,
            packets: row.packets,
            duration: row.duration_secs,
        }
    }
}
