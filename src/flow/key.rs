use std::fmt;
use std::net::{IpAddr, SocketAddr};

use pnet::packet::ip::IpNextHeaderProtocol;

use crate::packet::{protocol_name, PacketRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.addr, self.port).fmt(f)
    }
}

/// Direction-independent conversation identity. `lower <= upper` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub lower: Endpoint,
    pub upper: Endpoint,
    pub protocol: IpNextHeaderProtocol,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} ({})", self.lower, self.upper, protocol_name(self.protocol))
    }
}

/// Maps a packet to its flow key. The flag is `true` when the sender is `lower`.
pub fn normalize(packet: &PacketRecord) -> (FlowKey, bool) {
    let src = Endpoint::new(packet.src_ip, packet.src_port);
    let dst = Endpoint::new(packet.dst_ip, packet.dst_port);
    let sender_is_lower = src <= dst;
    let (lower, upper) = if sender_is_lower { (src, dst) } else { (dst, src) };
    (
        FlowKey {
            lower,
            upper,
            protocol: packet.protocol,
        },
        sender_is_lower,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TcpFlags;
    use crate::testutil::tcp_record;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_both_directions_share_a_key() {
        let out = tcp_record(0.0, ([10, 0, 0, 1], 1000), ([10, 0, 0, 2], 2000), 60, TcpFlags::SYN);
        let back = tcp_record(0.1, ([10, 0, 0, 2], 2000), ([10, 0, 0, 1], 1000), 60, TcpFlags::ACK);

        let (k1, out_lower) = normalize(&out);
        let (k2, back_lower) = normalize(&back);

        assert_eq!(k1, k2);
        assert!(out_lower);
        assert!(!back_lower);
        assert!(k1.lower <= k1.upper);
    }

    #[test]
    fn test_same_host_orders_by_port() {
        let packet = tcp_record(0.0, ([10, 0, 0, 1], 5000), ([10, 0, 0, 1], 80), 60, 0);
        let (key, sender_is_lower) = normalize(&packet);

        assert_eq!(key.lower.port, 80);
        assert!(!sender_is_lower);
    }

    #[test]
    fn test_protocol_is_part_of_key() {
        let tcp = tcp_record(0.0, ([10, 0, 0, 1], 53), ([10, 0, 0, 2], 53), 60, 0);
        let mut udp = tcp.clone();
        udp.protocol = IpNextHeaderProtocols::Udp;

        assert_ne!(normalize(&tcp).0, normalize(&udp).0);
    }

    #[test]
    fn test_endpoint_display() {
        let v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 443);
        let v6 = Endpoint::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8080);
        assert_eq!(v4.to_string(), "192.168.0.1:443");
        assert_eq!(v6.to_string(), "[::1]:8080");
    }
}
