use std::io;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};

use super::{PacketSource, SourceStats, StopSignal};
use crate::error::{FlowError, Result};
use crate::packet::{decode_frame, LinkType, PacketRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub is_up: bool,
}

pub fn list_interfaces() -> Vec<InterfaceSummary> {
    datalink::interfaces()
        .into_iter()
        .map(|iface| InterfaceSummary {
            addresses: iface.ips.iter().map(|net| net.ip()).collect(),
            is_up: iface.is_up(),
            name: iface.name,
        })
        .collect()
}

/// Frames from a network device, stamped with the wall clock on arrival.
///
/// Reads block for at most the configured timeout so a stop request is seen
/// promptly even on a silent link.
pub struct LiveSource {
    name: String,
    link: LinkType,
    rx: Box<dyn DataLinkReceiver>,
    stop: StopSignal,
    finished: bool,
    stats: SourceStats,
}

impl LiveSource {
    pub fn open(name: &str, read_timeout: Duration, stop: StopSignal) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| FlowError::SourceUnavailable(format!("no such interface: {}", name)))?;

        let config = Config {
            read_timeout: Some(read_timeout),
            ..Default::default()
        };
        let rx = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(_, rx)) => rx,
            Ok(_) => {
                return Err(FlowError::SourceUnavailable(format!(
                    "{}: unsupported channel type",
                    name
                )))
            }
            Err(e) => return Err(FlowError::SourceUnavailable(format!("{}: {}", name, e))),
        };

        let link = link_type(&interface);
        info!("Capturing on {} ({:?} framing)", name, link);
        Ok(Self {
            name: name.to_string(),
            link,
            rx,
            stop,
            finished: false,
            stats: SourceStats::default(),
        })
    }
}

fn link_type(interface: &NetworkInterface) -> LinkType {
    // Point-to-point links (tun, ppp) deliver bare IP packets.
    if interface.is_point_to_point() && interface.mac.is_none() {
        LinkType::RawIp
    } else {
        LinkType::Ethernet
    }
}

impl Iterator for LiveSource {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished || self.stop.is_stopped() {
                return None;
            }
            match self.rx.next() {
                Ok(frame) => {
                    self.stats.frames_read += 1;
                    self.stats.bytes_read += frame.len() as u64;
                    match decode_frame(self.link, frame, Utc::now()) {
                        Ok(Some(record)) => return Some(Ok(record)),
                        Ok(None) => self.stats.frames_ignored += 1,
                        Err(err) => return Some(Err(err)),
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("Read on {} interrupted by a signal", self.name);
                    continue;
                }
                Err(e) => {
                    warn!("Capture on {} failed: {}", self.name, e);
                    self.finished = true;
                    return Some(Err(FlowError::CaptureInterrupted(format!("{}: {}", self.name, e))));
                }
            }
        }
    }
}

impl PacketSource for LiveSource {
    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        debug!("Released {} after {} frames", self.name, self.stats.frames_read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_interfaces_has_unique_names() {
        let interfaces = list_interfaces();
        let mut names: Vec<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), interfaces.len());
    }

    #[test]
    fn test_unknown_interface_unavailable() {
        match LiveSource::open("flowmeter-missing0", Duration::from_millis(10), StopSignal::new()) {
            Err(FlowError::SourceUnavailable(msg)) => assert!(msg.contains("flowmeter-missing0")),
            Err(other) => panic!("Expected SourceUnavailable, got {:?}", other),
            Ok(_) => panic!("Expected SourceUnavailable, got a source"),
        }
    }
}
