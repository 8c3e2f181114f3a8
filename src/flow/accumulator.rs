use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use super::key::{Endpoint, FlowKey};
use super::record::{CompletedFlow, EndReason};
use crate::packet::PacketRecord;

/// Running statistics of one live flow.
#[derive(Debug, Clone)]
pub struct FlowAccumulator {
    pub key: FlowKey,
    pub id: u64,
    /// Sender of the first packet seen.
    pub originator: Endpoint,
    pub responder: Endpoint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    pub terminated: bool,
    /// Packets stamped earlier than `first_seen`.
    pub clock_skew: u64,
}

impl FlowAccumulator {
    /// Starts a flow from its first packet.
    pub fn new(id: u64, key: FlowKey, packet: &PacketRecord) -> Self {
        let mut acc = Self {
            key,
            id,
            originator: Endpoint::new(packet.src_ip, packet.src_port),
            responder: Endpoint::new(packet.dst_ip, packet.dst_port),
            first_seen: packet.timestamp,
            last_seen: packet.timestamp,
            fwd_bytes: 0,
            bwd_bytes: 0,
            fwd_packets: 0,
            bwd_packets: 0,
            syn_count: 0,
            fin_count: 0,
            rst_count: 0,
            terminated: false,
            clock_skew: 0,
        };
        acc.update(packet);
        acc
    }

    /// Folds a packet in. Returns `true` when the packet predates the flow.
    pub fn update(&mut self, packet: &PacketRecord) -> bool {
        let bytes = packet.length as u64;
        if Endpoint::new(packet.src_ip, packet.src_port) == self.originator {
            self.fwd_packets += 1;
            self.fwd_bytes += bytes;
        } else {
            self.bwd_packets += 1;
            self.bwd_bytes += bytes;
        }

        if let Some(flags) = packet.tcp_flags {
            if flags.syn() {
                self.syn_count += 1;
            }
            if flags.fin() {
                self.fin_count += 1;
            }
            if flags.rst() {
                self.rst_count += 1;
            }
            if flags.closes() {
                self.terminated = true;
            }
        }

        if packet.timestamp < self.first_seen {
            self.clock_skew += 1;
            debug!(
                "Flow {}: packet at {} predates first seen {}",
                self.id, packet.timestamp, self.first_seen
            );
            return true;
        }
        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
        false
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: TimeDelta) -> bool {
        now - self.last_seen > idle_timeout
    }

    pub fn exceeded_lifetime(&self, now: DateTime<Utc>, max_lifetime: TimeDelta) -> bool {
        now - self.first_seen > max_lifetime
    }

    pub fn complete(self, end_reason: EndReason) -> CompletedFlow {
        CompletedFlow {
            id: self.id,
            key: self.key,
            originator: self.originator,
            responder: self.responder,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            fwd_packets: self.fwd_packets,
            fwd_bytes: self.fwd_bytes,
            bwd_packets: self.bwd_packets,
            bwd_bytes: self.bwd_bytes,
            syn_count: self.syn_count,
            fin_count: self.fin_count,
            rst_count: self.rst_count,
            duration: self.last_seen - self.first_seen,
            end_reason,
        }
    }
}
