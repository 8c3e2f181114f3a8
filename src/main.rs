use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use flowmeter::config::{CaptureMode, FlowConfig};
use flowmeter::error::{FlowError, Result};
use flowmeter::sink::{CsvSink, RowFormat, RowSink};
use flowmeter::source::{list_interfaces, CaptureSource, StopSignal};

const DEFAULT_CONFIG_PATH: &str = "flowmeter.toml";

/// Reconstructs bidirectional flows from a capture file or a live interface
/// and writes one feature row per completed flow as CSV.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Recorded capture (pcap or pcapng)
    #[arg(short, long, conflicts_with = "interface")]
    pcap: Option<PathBuf>,

    /// Network interface to capture on
    #[arg(short, long)]
    interface: Option<String>,

    /// CSV destination, stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write flow identity and counters in front of the feature columns
    #[arg(long)]
    detailed: bool,

    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[arg(long)]
    idle_timeout: Option<u64>,

    #[arg(long)]
    max_lifetime: Option<u64>,

    #[arg(long)]
    scan_interval: Option<u64>,

    /// Force bounded or live scheduling
    #[arg(long, value_parser = parse_mode)]
    mode: Option<CaptureMode>,

    /// Print the available interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

fn parse_mode(value: &str) -> std::result::Result<CaptureMode, String> {
    match value {
        "bounded" => Ok(CaptureMode::Bounded),
        "live" => Ok(CaptureMode::Live),
        other => Err(format!("unknown mode '{}', expected bounded or live", other)),
    }
}

impl Args {
    fn apply(&self, config: &mut FlowConfig) {
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.max_lifetime {
            config.max_lifetime_secs = secs;
        }
        if let Some(secs) = self.scan_interval {
            config.scan_interval_secs = secs;
        }
        if self.mode.is_some() {
            config.mode = self.mode;
        }
    }

    fn capture_source(&self) -> Result<CaptureSource> {
        match (&self.pcap, &self.interface) {
            (Some(path), _) => Ok(CaptureSource::File(path.clone())),
            (None, Some(name)) => Ok(CaptureSource::Interface(name.clone())),
            (None, None) => Err(FlowError::Config(
                "one of --pcap or --interface is required".to_string(),
            )),
        }
    }
}

fn print_interfaces() {
    println!("Available network interfaces:");
    for iface in list_interfaces() {
        let addrs: Vec<String> = iface.addresses.iter().map(|a| a.to_string()).collect();
        println!(
            "  {:<16} {:<5} {}",
            iface.name,
            if iface.is_up { "up" } else { "down" },
            if addrs.is_empty() { "-".to_string() } else { addrs.join(", ") }
        );
    }
}

fn run(args: Args) -> Result<()> {
    if args.list_interfaces {
        print_interfaces();
        return Ok(());
    }

    let mut config = FlowConfig::load(&args.config)?;
    args.apply(&mut config);
    config.validate()?;

    let capture = args.capture_source()?;
    let stop = StopSignal::new();
    if config.mode.unwrap_or_else(|| capture.default_mode()) == CaptureMode::Live {
        let handler_stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, stopping capture...");
            handler_stop.stop();
        })?;
        info!("Capturing... press Ctrl+C to stop");
    }

    let format = if args.detailed {
        RowFormat::Detailed
    } else {
        RowFormat::Features
    };
    let mut sink: Box<dyn RowSink> = match &args.output {
        Some(path) => Box::new(CsvSink::create(path, format)?),
        None => Box::new(CsvSink::new(io::stdout(), format)),
    };

    let report = flowmeter::run(&capture, &config, &stop, &mut sink)?;
    info!(
        "Done: {} packets, {} flows written{}",
        report.packets_ingested,
        report.flows_emitted,
        if report.interrupted { " (capture interrupted)" } else { "" }
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Args::parse()) {
        error!("{}", err);
        process::exit(1);
    }
}
