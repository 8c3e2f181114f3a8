//! Frame and capture builders shared by the unit tests.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::tcp::MutableTcpPacket;
use pnet::packet::udp::MutableUdpPacket;

use crate::error::{FlowError, Result};
use crate::export::FeatureRow;
use crate::flow::CompletedFlow;
use crate::packet::{PacketRecord, TcpFlags};
use crate::sink::{RowSink, VecSink};
use crate::source::{PacketSource, SourceStats, StopSignal};

const BASE_EPOCH_SECS: i64 = 1_700_000_000;

/// Capture timestamp `secs` after a fixed epoch, microsecond precision.
pub fn ts(secs: f64) -> DateTime<Utc> {
    let base = DateTime::from_timestamp(BASE_EPOCH_SECS, 0).unwrap();
    base + TimeDelta::microseconds((secs * 1_000_000.0).round() as i64)
}

pub fn ipv4_tcp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8, payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + 20 + payload_len];
    {
        let mut tcp = MutableTcpPacket::new(&mut buf[20..]).unwrap();
        tcp.set_source(sport);
        tcp.set_destination(dport);
        tcp.set_data_offset(5);
        tcp.set_flags(flags);
        tcp.set_window(1024);
    }
    write_ipv4_header(&mut buf, src, dst, IpNextHeaderProtocols::Tcp);
    buf
}

pub fn ipv4_udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + 8 + payload_len];
    {
        let mut udp = MutableUdpPacket::new(&mut buf[20..]).unwrap();
        udp.set_source(sport);
        udp.set_destination(dport);
        udp.set_length((8 + payload_len) as u16);
    }
    write_ipv4_header(&mut buf, src, dst, IpNextHeaderProtocols::Udp);
    buf
}

fn write_ipv4_header(buf: &mut [u8], src: [u8; 4], dst: [u8; 4], protocol: IpNextHeaderProtocol) {
    let total_len = buf.len() as u16;
    let mut ip = MutableIpv4Packet::new(buf).unwrap();
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(total_len);
    ip.set_ttl(64);
    ip.set_next_level_protocol(protocol);
    ip.set_source(Ipv4Addr::from(src));
    ip.set_destination(Ipv4Addr::from(dst));
}

pub fn ethernet_frame(ip_packet: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 14 + ip_packet.len()];
    let mut ethernet = MutableEthernetPacket::new(&mut buf).unwrap();
    ethernet.set_ethertype(EtherTypes::Ipv4);
    ethernet.set_payload(ip_packet);
    buf
}

/// Little-endian, microsecond-resolution legacy pcap.
pub fn pcap_bytes(linktype: u32, frames: &[(f64, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&linktype.to_le_bytes());

    for (secs, frame) in frames {
        let stamp = ts(*secs);
        out.extend_from_slice(&(stamp.timestamp() as u32).to_le_bytes());
        out.extend_from_slice(&stamp.timestamp_subsec_micros().to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

pub fn write_capture(bytes: &[u8]) -> tempfile::NamedTempFile {
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".pcap").tempfile().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// A decoded TCP record between two IPv4 endpoints.
pub fn tcp_record(at: f64, src: ([u8; 4], u16), dst: ([u8; 4], u16), length: u32, flags: u8) -> PacketRecord {
    PacketRecord {
        timestamp: ts(at),
        src_ip: IpAddr::V4(Ipv4Addr::from(src.0)),
        dst_ip: IpAddr::V4(Ipv4Addr::from(dst.0)),
        src_port: src.1,
        dst_port: dst.1,
        protocol: IpNextHeaderProtocols::Tcp,
        length,
        payload_len: length.saturating_sub(40),
        tcp_flags: Some(TcpFlags(flags)),
    }
}

/// Same record, stamped with an absolute time instead of the test epoch.
pub fn stamped(mut record: PacketRecord, timestamp: DateTime<Utc>) -> PacketRecord {
    record.timestamp = timestamp;
    record
}

/// Shared, ordered list of session events seen by sources and sinks.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// `VecSink` that also logs every row and flush.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub inner: VecSink,
    log: EventLog,
}

impl RecordingSink {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: VecSink::new(),
            log,
        }
    }
}

impl RowSink for RecordingSink {
    fn accept(&mut self, flow: &CompletedFlow, row: &FeatureRow) -> Result<()> {
        self.log.push(format!("row {}", flow.responder.port));
        self.inner.accept(flow, row)
    }

    fn flush(&mut self) -> Result<()> {
        self.log.push("flush");
        self.inner.flush()
    }
}

/// In-memory stand-in for a live device: yields its items, then blocks until
/// stopped. Like a device, it ends right after a `CaptureInterrupted`.
pub struct ReplaySource {
    items: VecDeque<Result<PacketRecord>>,
    stop: StopSignal,
    interrupted: bool,
    stats: SourceStats,
    log: Option<EventLog>,
}

impl ReplaySource {
    pub fn new(items: Vec<Result<PacketRecord>>, stop: StopSignal) -> Self {
        Self {
            items: items.into(),
            stop,
            interrupted: false,
            stats: SourceStats::default(),
            log: None,
        }
    }

    /// Logs "source released" when the source is dropped.
    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        if let Some(log) = &self.log {
            log.push("source released");
        }
    }
}

impl Iterator for ReplaySource {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.interrupted {
            return None;
        }
        if let Some(item) = self.items.pop_front() {
            self.stats.frames_read += 1;
            self.interrupted = matches!(item, Err(FlowError::CaptureInterrupted(_)));
            return Some(item);
        }
        while !self.stop.is_stopped() {
            thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

impl PacketSource for ReplaySource {
    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
