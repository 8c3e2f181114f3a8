//! Packet sources: recorded capture files and live interfaces.
//!
//! Every source is a lazy, ordered sequence of `Result<PacketRecord>`. A
//! `MalformedCapture` item stands for one frame that could not be decoded;
//! the sequence carries on after it. `CaptureInterrupted` is always the last
//! item a live source produces.

mod file;
mod live;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{CaptureMode, FlowConfig};
use crate::error::Result;
use crate::packet::PacketRecord;

pub use file::FileSource;
pub use live::{list_interfaces, InterfaceSummary, LiveSource};

/// Where packets come from. Already resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    File(PathBuf),
    Interface(String),
}

impl CaptureSource {
    pub fn default_mode(&self) -> CaptureMode {
        match self {
            CaptureSource::File(_) => CaptureMode::Bounded,
            CaptureSource::Interface(_) => CaptureMode::Live,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub bytes_read: u64,
    /// Well-formed frames without IP traffic.
    pub frames_ignored: u64,
}

pub trait PacketSource: Iterator<Item = Result<PacketRecord>> + Send {
    fn stats(&self) -> SourceStats;
}

impl<P: PacketSource + ?Sized> PacketSource for Box<P> {
    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Shared stop request, set from a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opens a capture source.
///
/// Fails with `SourceUnavailable` when the file or device cannot be opened
/// and with `MalformedCapture` when a file is not a pcap/pcapng container.
pub fn open(source: &CaptureSource, config: &FlowConfig, stop: &StopSignal) -> Result<Box<dyn PacketSource>> {
    match source {
        CaptureSource::File(path) => Ok(Box::new(FileSource::open(path)?)),
        CaptureSource::Interface(name) => Ok(Box::new(LiveSource::open(
            name,
            config.read_timeout(),
            stop.clone(),
        )?)),
    }
}
