//! Session driver: feeds packets into a flow table and decides when flows
//! leave it.
//!
//! Bounded sessions run on the caller's thread and only use packet
//! timestamps, so replaying a capture gives the same rows every time. Live
//! sessions read the device on a dedicated thread and expire flows against
//! the wall clock on a fixed tick.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver};
use log::{debug, info, warn};

use crate::config::{CaptureMode, FlowConfig};
use crate::error::{FlowError, Result};
use crate::export::FeatureExporter;
use crate::flow::{CompletedFlow, FlowTable};
use crate::packet::PacketRecord;
use crate::sink::RowSink;
use crate::source::{self, CaptureSource, PacketSource, SourceStats, StopSignal};

/// Packets buffered between the capture thread and the session loop.
const CHANNEL_CAPACITY: usize = 4096;

/// Totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub packets_ingested: u64,
    /// Frames skipped as malformed.
    pub malformed_frames: u64,
    /// Well-formed frames that carried no IP traffic.
    pub ignored_frames: u64,
    pub clock_skew_anomalies: u64,
    pub clamped_durations: u64,
    pub flows_created: u64,
    pub flows_emitted: u64,
    /// The live device went away before a stop was requested.
    pub interrupted: bool,
}

enum Event {
    Packet(PacketRecord),
    Skipped,
    Interrupted,
}

/// Per-session state. Only ever touched from one thread.
struct Session<'a, K: RowSink + ?Sized> {
    table: FlowTable,
    exporter: FeatureExporter,
    sink: &'a mut K,
    report: SessionReport,
    since_scan: u64,
}

impl<'a, K: RowSink + ?Sized> Session<'a, K> {
    fn new(sink: &'a mut K) -> Self {
        Self {
            table: FlowTable::new(),
            exporter: FeatureExporter::new(),
            sink,
            report: SessionReport::default(),
            since_scan: 0,
        }
    }

    fn triage(&mut self, item: Result<PacketRecord>) -> Result<Event> {
        match item {
            Ok(packet) => Ok(Event::Packet(packet)),
            Err(err) if err.is_recoverable() => {
                self.report.malformed_frames += 1;
                debug!("Skipping frame: {}", err);
                Ok(Event::Skipped)
            }
            Err(FlowError::CaptureInterrupted(reason)) => {
                warn!("Capture interrupted: {}", reason);
                self.report.interrupted = true;
                Ok(Event::Interrupted)
            }
            Err(err) => Err(err),
        }
    }

    /// Folds a packet in and emits its flow at once if TCP closed it.
    fn ingest(&mut self, packet: &PacketRecord) -> Result<()> {
        let ingested = self.table.ingest(packet);
        self.report.packets_ingested += 1;
        self.since_scan += 1;
        if ingested.terminated {
            if let Some(flow) = self.table.take_terminated(&ingested.key) {
                self.emit(vec![flow])?;
            }
        }
        Ok(())
    }

    fn expire(&mut self, now: DateTime<Utc>, config: &FlowConfig) -> Result<()> {
        self.since_scan = 0;
        let expired = self
            .table
            .drain_expired(now, config.idle_timeout(), config.max_lifetime());
        if !expired.is_empty() {
            debug!("Expired {} flows at {}", expired.len(), now);
        }
        self.emit(expired)
    }

    fn scan_due(&self, config: &FlowConfig) -> bool {
        config
            .scan_every_packets
            .map_or(false, |every| self.since_scan >= every)
    }

    fn emit(&mut self, flows: Vec<CompletedFlow>) -> Result<()> {
        for flow in flows {
            let row = self.exporter.export(&flow);
            self.sink.accept(&flow, &row)?;
            self.report.flows_emitted += 1;
        }
        Ok(())
    }

    /// Forced drain of everything still live, then flush.
    fn finish(mut self, source_stats: SourceStats) -> Result<SessionReport> {
        let remaining = self.table.drain_all();
        self.emit(remaining)?;
        self.sink.flush()?;

        let table_stats = self.table.stats();
        let mut report = self.report;
        report.ignored_frames = source_stats.frames_ignored;
        report.clock_skew_anomalies = table_stats.clock_skew_anomalies;
        report.flows_created = table_stats.flows_created;
        report.clamped_durations = self.exporter.clamped_durations();
        Ok(report)
    }
}

pub struct ExpirationScheduler {
    config: FlowConfig,
}

impl ExpirationScheduler {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    /// One pass over a finite source, then a single forced drain.
    pub fn run_bounded<S, K>(&self, mut source: S, sink: &mut K) -> Result<SessionReport>
    where
        S: PacketSource,
        K: RowSink + ?Sized,
    {
        info!("Starting bounded session");
        let scan_interval = self.config.scan_interval();
        let mut session = Session::new(sink);
        let mut next_scan: Option<DateTime<Utc>> = None;

        while let Some(item) = source.next() {
            let packet = match session.triage(item)? {
                Event::Packet(packet) => packet,
                Event::Skipped => continue,
                Event::Interrupted => break,
            };

            if self.config.capture_clock_expiry {
                let now = packet.timestamp;
                let due = match next_scan {
                    Some(at) => now >= at || session.scan_due(&self.config),
                    None => false,
                };
                if due {
                    session.expire(now, &self.config)?;
                }
                if due || next_scan.is_none() {
                    next_scan = Some(now + scan_interval);
                }
            }

            session.ingest(&packet)?;
        }

        let report = session.finish(source.stats())?;
        log_report("Bounded", &report);
        Ok(report)
    }

    /// Reads `source` on a capture thread until it ends or `stop` is set,
    /// expiring flows against the wall clock every scan interval.
    pub fn run_live<S, K>(&self, source: S, stop: &StopSignal, sink: &mut K) -> Result<SessionReport>
    where
        S: PacketSource + 'static,
        K: RowSink + ?Sized,
    {
        info!(
            "Starting live session (idle {}s, lifetime {}s, scan every {}s)",
            self.config.idle_timeout_secs, self.config.max_lifetime_secs, self.config.scan_interval_secs
        );

        let (tx, rx) = crossbeam_channel::bounded::<Result<PacketRecord>>(CHANNEL_CAPACITY);
        let reader_stop = stop.clone();
        let reader = thread::Builder::new()
            .name("flowmeter-capture".to_string())
            .spawn(move || {
                let mut source = source;
                while let Some(item) = source.next() {
                    if tx.send(item).is_err() || reader_stop.is_stopped() {
                        break;
                    }
                }
                source
            })?;

        let mut session = Session::new(sink);
        if let Err(err) = self.pump(&rx, &mut session) {
            stop.stop();
            drop(rx);
            if reader.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
            return Err(err);
        }

        // The reader has hung up: every queued packet is already ingested.
        let source = reader
            .join()
            .map_err(|_| FlowError::CaptureInterrupted("capture thread panicked".to_string()))?;
        let report = session.finish(source.stats())?;
        drop(source);

        log_report("Live", &report);
        Ok(report)
    }

    fn pump<K: RowSink + ?Sized>(
        &self,
        rx: &Receiver<Result<PacketRecord>>,
        session: &mut Session<'_, K>,
    ) -> Result<()> {
        let ticker = crossbeam_channel::tick(Duration::from_secs(self.config.scan_interval_secs));
        loop {
            select! {
                recv(rx) -> msg => {
                    let item = match msg {
                        Ok(item) => item,
                        Err(_) => return Ok(()),
                    };
                    if let Event::Packet(packet) = session.triage(item)? {
                        session.ingest(&packet)?;
                        if session.scan_due(&self.config) {
                            session.expire(Utc::now(), &self.config)?;
                        }
                    }
                }
                recv(ticker) -> _ => session.expire(Utc::now(), &self.config)?,
            }
        }
    }
}

fn log_report(kind: &str, report: &SessionReport) {
    info!(
        "{} session finished: {} packets, {} flows created, {} rows emitted",
        kind, report.packets_ingested, report.flows_created, report.flows_emitted
    );
    if report.malformed_frames > 0 || report.clock_skew_anomalies > 0 || report.clamped_durations > 0 {
        info!(
            "{} malformed frames, {} clock skew anomalies, {} clamped durations",
            report.malformed_frames, report.clock_skew_anomalies, report.clamped_durations
        );
    }
}

/// Opens `capture` and runs it in the configured mode, or the mode the
/// source implies when none is set.
pub fn run<K: RowSink + ?Sized>(
    capture: &CaptureSource,
    config: &FlowConfig,
    stop: &StopSignal,
    sink: &mut K,
) -> Result<SessionReport> {
    config.validate()?;
    let packets = source::open(capture, config, stop)?;
    let scheduler = ExpirationScheduler::new(config.clone());
    match config.mode.unwrap_or_else(|| capture.default_mode()) {
        CaptureMode::Bounded => scheduler.run_bounded(packets, sink),
        CaptureMode::Live => scheduler.run_live(packets, stop, sink),
    }
}
