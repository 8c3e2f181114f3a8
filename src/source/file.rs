use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use memmap2::Mmap;
use pcap_parser::{
    parse_block_be, parse_block_le, parse_pcap_frame, parse_pcap_frame_be, parse_pcap_header,
    parse_sectionheaderblock, Block, InterfaceDescriptionBlock, OptionCode,
};

use super::{PacketSource, SourceStats};
use crate::error::{FlowError, Result};
use crate::packet::{decode_frame, LinkType, PacketRecord};

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
const MICROS_PER_SEC: u128 = 1_000_000;

/// Reads a pcap or pcapng file through a read-only memory map.
pub struct FileSource {
    map: Option<Mmap>,
    offset: usize,
    format: Format,
    finished: bool,
    last_timestamp: DateTime<Utc>,
    stats: SourceStats,
}

enum Format {
    Legacy {
        big_endian: bool,
        nanos: bool,
        link: LinkType,
    },
    Ng {
        big_endian: bool,
        interfaces: Vec<Interface>,
    },
}

struct Interface {
    link: Option<LinkType>,
    ticks_per_sec: u64,
}

enum Step {
    Skip(usize),
    Frame {
        consumed: usize,
        bytes: usize,
        result: Result<Option<PacketRecord>>,
    },
    Corrupt(String),
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable = |e: std::io::Error| FlowError::SourceUnavailable(format!("{}: {}", path.display(), e));

        let file = File::open(path).map_err(unavailable)?;
        let len = file.metadata().map_err(unavailable)?.len();

        let mut source = Self {
            map: None,
            offset: 0,
            format: Format::Ng {
                big_endian: false,
                interfaces: Vec::new(),
            },
            finished: len == 0,
            last_timestamp: DateTime::<Utc>::default(),
            stats: SourceStats::default(),
        };
        if len == 0 {
            info!("{} is empty", path.display());
            return Ok(source);
        }

        // The map is read-only and the file is not expected to change under us.
        let map = unsafe { Mmap::map(&file) }.map_err(unavailable)?;
        let (offset, format) = read_header(&map)?;
        info!("Opened {} ({} bytes, {})", path.display(), len, format.name());

        source.map = Some(map);
        source.offset = offset;
        source.format = format;
        Ok(source)
    }
}

impl Format {
    fn name(&self) -> &'static str {
        match self {
            Format::Legacy { .. } => "pcap",
            Format::Ng { .. } => "pcapng",
        }
    }
}

fn read_header(data: &[u8]) -> Result<(usize, Format)> {
    if data.starts_with(&PCAPNG_MAGIC) {
        let (rest, shb) = parse_sectionheaderblock(data)
            .map_err(|_| FlowError::malformed("invalid pcapng section header"))?;
        let format = Format::Ng {
            big_endian: shb.big_endian(),
            interfaces: Vec::new(),
        };
        return Ok((data.len() - rest.len(), format));
    }

    let (rest, header) =
        parse_pcap_header(data).map_err(|_| FlowError::malformed("not a pcap or pcapng file"))?;
    let link = LinkType::from_linktype(header.network.0)
        .ok_or_else(|| FlowError::malformed(format!("unsupported link type {}", header.network.0)))?;
    let format = Format::Legacy {
        big_endian: header.is_bigendian(),
        nanos: header.is_nanosecond_precision(),
        link,
    };
    Ok((data.len() - rest.len(), format))
}

fn next_legacy(data: &[u8], big_endian: bool, nanos: bool, link: LinkType) -> Step {
    let parsed = if big_endian {
        parse_pcap_frame_be(data)
    } else {
        parse_pcap_frame(data)
    };
    let (rest, block) = match parsed {
        Ok(parsed) => parsed,
        Err(_) => return Step::Corrupt("unreadable pcap record".to_string()),
    };

    let frame = &block.data[..(block.caplen as usize).min(block.data.len())];
    let sub_micros = if nanos { block.ts_usec / 1000 } else { block.ts_usec };
    let result = timestamp(block.ts_sec as i64, sub_micros).and_then(|ts| decode_frame(link, frame, ts));

    Step::Frame {
        consumed: data.len() - rest.len(),
        bytes: frame.len(),
        result,
    }
}

fn next_ng(
    data: &[u8],
    big_endian: &mut bool,
    interfaces: &mut Vec<Interface>,
    last_timestamp: DateTime<Utc>,
) -> Step {
    let parsed = if *big_endian {
        parse_block_be(data)
    } else {
        parse_block_le(data)
    };
    let (rest, block) = match parsed {
        Ok(parsed) => parsed,
        Err(_) => return Step::Corrupt("unreadable pcapng block".to_string()),
    };
    let consumed = data.len() - rest.len();

    match block {
        Block::SectionHeader(shb) => {
            *big_endian = shb.big_endian();
            interfaces.clear();
            Step::Skip(consumed)
        }
        Block::InterfaceDescription(idb) => {
            interfaces.push(Interface::from_block(&idb));
            Step::Skip(consumed)
        }
        Block::EnhancedPacket(epb) => {
            let frame = &epb.data[..(epb.caplen as usize).min(epb.data.len())];
            let result = match interfaces.get(epb.if_id as usize) {
                Some(iface) => iface
                    .timestamp(epb.ts_high, epb.ts_low)
                    .and_then(|ts| iface.decode(frame, ts)),
                None => Err(FlowError::malformed(format!(
                    "packet on undeclared interface {}",
                    epb.if_id
                ))),
            };
            Step::Frame {
                consumed,
                bytes: frame.len(),
                result,
            }
        }
        Block::SimplePacket(spb) => {
            // No timestamp in simple packet blocks: keep the capture clock where it was.
            let frame = &spb.data[..(spb.origlen as usize).min(spb.data.len())];
            let result = match interfaces.first() {
                Some(iface) => iface.decode(frame, last_timestamp),
                None => Err(FlowError::malformed("simple packet before any interface")),
            };
            Step::Frame {
                consumed,
                bytes: frame.len(),
                result,
            }
        }
        _ => Step::Skip(consumed),
    }
}

impl Interface {
    fn from_block(idb: &InterfaceDescriptionBlock) -> Self {
        let mut ticks_per_sec = 1_000_000u64;
        for opt in &idb.options {
            if opt.code == OptionCode::IfTsresol {
                if let Some(&val) = opt.value.first() {
                    let exp = (val & 0x7f) as u32;
                    let resolution = if val & 0x80 != 0 {
                        2u64.checked_pow(exp)
                    } else {
                        10u64.checked_pow(exp)
                    };
                    ticks_per_sec = resolution.unwrap_or(ticks_per_sec);
                }
            }
        }
        Self {
            link: LinkType::from_linktype(idb.linktype.0),
            ticks_per_sec,
        }
    }

    fn timestamp(&self, high: u32, low: u32) -> Result<DateTime<Utc>> {
        let ticks = ((high as u64) << 32) | low as u64;
        let secs = ticks / self.ticks_per_sec;
        let frac = (ticks % self.ticks_per_sec) as u128;
        let micros = frac * MICROS_PER_SEC / self.ticks_per_sec as u128;
        timestamp(secs as i64, micros as u32)
    }

    fn decode(&self, frame: &[u8], ts: DateTime<Utc>) -> Result<Option<PacketRecord>> {
        match self.link {
            Some(link) => decode_frame(link, frame, ts),
            None => Err(FlowError::malformed("frame on interface with unsupported link type")),
        }
    }
}

fn timestamp(secs: i64, micros: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, micros.saturating_mul(1000))
        .ok_or_else(|| FlowError::malformed(format!("timestamp out of range: {}.{:06}", secs, micros)))
}

impl Iterator for FileSource {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let FileSource {
            map,
            offset,
            format,
            finished,
            last_timestamp,
            stats,
        } = self;

        loop {
            if *finished {
                return None;
            }
            let data: &[u8] = match map {
                Some(map) => &map[*offset..],
                None => &[],
            };
            if data.is_empty() {
                *finished = true;
                return None;
            }

            let step = match format {
                Format::Legacy {
                    big_endian,
                    nanos,
                    link,
                } => next_legacy(data, *big_endian, *nanos, *link),
                Format::Ng {
                    big_endian,
                    interfaces,
                } => next_ng(data, big_endian, interfaces, *last_timestamp),
            };

            match step {
                Step::Skip(consumed) if consumed > 0 => *offset += consumed,
                Step::Frame {
                    consumed,
                    bytes,
                    result,
                } if consumed > 0 => {
                    *offset += consumed;
                    stats.frames_read += 1;
                    stats.bytes_read += bytes as u64;
                    match result {
                        Ok(Some(record)) => {
                            *last_timestamp = record.timestamp;
                            return Some(Ok(record));
                        }
                        Ok(None) => stats.frames_ignored += 1,
                        Err(err) => return Some(Err(err)),
                    }
                }
                Step::Corrupt(reason) => {
                    debug!("Stopping at byte {}: {}", offset, reason);
                    *finished = true;
                    return Some(Err(FlowError::malformed(format!("{} at byte {}", reason, offset))));
                }
                _ => {
                    *finished = true;
                    return Some(Err(FlowError::malformed(format!("zero-length block at byte {}", offset))));
                }
            }
        }
    }
}

impl PacketSource for FileSource {
    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
