use std::net::IpAddr;

use chrono::{DateTime, Utc};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;

use crate::error::{FlowError, Result};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;
const SLL_HEADER: usize = 16;
const LOOPBACK_HEADER: usize = 4;

/// TCP control bits, as carried in the 8-bit flags field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    /// FIN or RST: the connection is being torn down.
    pub fn closes(self) -> bool {
        self.fin() || self.rst()
    }
}

/// One captured packet, reduced to what flow keying and statistics need.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpNextHeaderProtocol,
    /// IP-layer length as declared by the header, independent of snap length.
    pub length: u32,
    /// Transport payload length (IP payload for portless protocols).
    pub payload_len: u32,
    pub tcp_flags: Option<TcpFlags>,
}

/// Framing in front of the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
    LinuxSll,
    Loopback,
}

impl LinkType {
    /// Maps a pcap LINKTYPE_* value.
    pub fn from_linktype(value: i32) -> Option<Self> {
        match value {
            0 => Some(LinkType::Loopback),
            1 => Some(LinkType::Ethernet),
            12 | 101 | 228 | 229 => Some(LinkType::RawIp),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }
}

/// Decodes one link-layer frame.
///
/// `Ok(None)` means the frame is well formed but carries no IP traffic (ARP,
/// LLDP, ...). `Err(MalformedCapture)` means the headers are broken.
pub fn decode_frame(
    link: LinkType,
    frame: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<Option<PacketRecord>> {
    match link {
        LinkType::Ethernet => decode_ethernet(frame, timestamp),
        LinkType::RawIp => decode_ip(frame, timestamp).map(Some),
        LinkType::LinuxSll => {
            if frame.len() < SLL_HEADER {
                return Err(FlowError::malformed("truncated Linux SLL header"));
            }
            let ethertype = EtherType(u16::from_be_bytes([frame[14], frame[15]]));
            decode_ethertype(ethertype, &frame[SLL_HEADER..], timestamp)
        }
        LinkType::Loopback => {
            if frame.len() < LOOPBACK_HEADER {
                return Err(FlowError::malformed("truncated loopback header"));
            }
            decode_ip(&frame[LOOPBACK_HEADER..], timestamp).map(Some)
        }
    }
}

fn decode_ethernet(frame: &[u8], timestamp: DateTime<Utc>) -> Result<Option<PacketRecord>> {
    let ethernet =
        EthernetPacket::new(frame).ok_or_else(|| FlowError::malformed("truncated Ethernet header"))?;
    decode_ethertype(ethernet.get_ethertype(), ethernet.payload(), timestamp)
}

fn decode_ethertype(
    ethertype: EtherType,
    payload: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<Option<PacketRecord>> {
    match ethertype {
        EtherTypes::Ipv4 => decode_ipv4(payload, timestamp).map(Some),
        EtherTypes::Ipv6 => decode_ipv6(payload, timestamp).map(Some),
        EtherTypes::Vlan | EtherTypes::PBridge | EtherTypes::QinQ => {
            let vlan =
                VlanPacket::new(payload).ok_or_else(|| FlowError::malformed("truncated 802.1Q tag"))?;
            decode_ethertype(vlan.get_ethertype(), vlan.payload(), timestamp)
        }
        _ => Ok(None),
    }
}

fn decode_ip(data: &[u8], timestamp: DateTime<Utc>) -> Result<PacketRecord> {
    match data.first().map(|b| b >> 4) {
        Some(4) => decode_ipv4(data, timestamp),
        Some(6) => decode_ipv6(data, timestamp),
        Some(v) => Err(FlowError::malformed(format!("unknown IP version {}", v))),
        None => Err(FlowError::malformed("empty IP packet")),
    }
}

fn decode_ipv4(data: &[u8], timestamp: DateTime<Utc>) -> Result<PacketRecord> {
    let ipv4 = Ipv4Packet::new(data).ok_or_else(|| FlowError::malformed("truncated IPv4 header"))?;
    let header_len = ipv4.get_header_length() as usize * 4;
    let total_len = ipv4.get_total_length() as usize;

    if ipv4.get_version() != 4 {
        return Err(FlowError::malformed("IPv4 version field mismatch"));
    }
    if header_len < IPV4_MIN_HEADER || header_len > data.len() {
        return Err(FlowError::malformed(format!("bad IPv4 header length {}", header_len)));
    }
    if total_len < header_len {
        return Err(FlowError::malformed(format!("bad IPv4 total length {}", total_len)));
    }

    let segment = &data[header_len..total_len.min(data.len())];
    // Non-first fragments carry no transport header.
    let first_fragment = ipv4.get_fragment_offset() == 0;
    let protocol = ipv4.get_next_level_protocol();
    let transport = decode_transport(protocol, segment, total_len - header_len, first_fragment)?;

    Ok(PacketRecord {
        timestamp,
        src_ip: IpAddr::V4(ipv4.get_source()),
        dst_ip: IpAddr::V4(ipv4.get_destination()),
        src_port: transport.src_port,
        dst_port: transport.dst_port,
        protocol,
        length: total_len as u32,
        payload_len: transport.payload_len,
        tcp_flags: transport.tcp_flags,
    })
}

fn decode_ipv6(data: &[u8], timestamp: DateTime<Utc>) -> Result<PacketRecord> {
    let ipv6 = Ipv6Packet::new(data).ok_or_else(|| FlowError::malformed("truncated IPv6 header"))?;
    if ipv6.get_version() != 6 {
        return Err(FlowError::malformed("IPv6 version field mismatch"));
    }

    let payload_len = ipv6.get_payload_length() as usize;
    let segment = &data[IPV6_HEADER..(IPV6_HEADER + payload_len).min(data.len())];
    // Extension headers are not walked; they key the flow with port 0.
    let protocol = ipv6.get_next_header();
    let transport = decode_transport(protocol, segment, payload_len, true)?;

    Ok(PacketRecord {
        timestamp,
        src_ip: IpAddr::V6(ipv6.get_source()),
        dst_ip: IpAddr::V6(ipv6.get_destination()),
        src_port: transport.src_port,
        dst_port: transport.dst_port,
        protocol,
        length: (IPV6_HEADER + payload_len) as u32,
        payload_len: transport.payload_len,
        tcp_flags: transport.tcp_flags,
    })
}

struct Transport {
    src_port: u16,
    dst_port: u16,
    payload_len: u32,
    tcp_flags: Option<TcpFlags>,
}

fn decode_transport(
    protocol: IpNextHeaderProtocol,
    segment: &[u8],
    ip_payload_len: usize,
    has_header: bool,
) -> Result<Transport> {
    let portless = Transport {
        src_port: 0,
        dst_port: 0,
        payload_len: ip_payload_len as u32,
        tcp_flags: None,
    };
    if !has_header {
        return Ok(portless);
    }

    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(segment).ok_or_else(|| FlowError::malformed("truncated TCP header"))?;
            let header_len = tcp.get_data_offset() as usize * 4;
            Ok(Transport {
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                payload_len: ip_payload_len.saturating_sub(header_len) as u32,
                tcp_flags: Some(TcpFlags(tcp.get_flags())),
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(segment).ok_or_else(|| FlowError::malformed("truncated UDP header"))?;
            Ok(Transport {
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload_len: ip_payload_len.saturating_sub(UDP_HEADER) as u32,
                tcp_flags: None,
            })
        }
        _ => Ok(portless),
    }
}

/// Short protocol label used in reports.
pub fn protocol_name(protocol: IpNextHeaderProtocol) -> String {
    match protocol {
        IpNextHeaderProtocols::Tcp => "TCP".to_string(),
        IpNextHeaderProtocols::Udp => "UDP".to_string(),
        IpNextHeaderProtocols::Icmp => "ICMP".to_string(),
        IpNextHeaderProtocols::Icmpv6 => "ICMPv6".to_string(),
        other => other.0.to_string(),
    }
}
