use std::time::Duration;

use chrono::TimeDelta;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{FlowError, Result};

const DEFAULT_ENV_VAR_PREFIX: &str = "FLOWMETER";

// Upper bound for every timeout knob; keeps TimeDelta arithmetic far from overflow.
const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

/// How a session is scheduled.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Single pass over a finite source, then one forced drain.
    Bounded,
    /// Ingestion thread plus a periodic expiry scan until stopped.
    Live,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub scan_interval_secs: u64,
    /// Also scan after this many packets, in addition to the timer.
    pub scan_every_packets: Option<u64>,
    /// Overrides the mode implied by the capture source.
    pub mode: Option<CaptureMode>,
    /// Bounded mode only: expire flows against packet timestamps while reading.
    pub capture_clock_expiry: bool,
    /// How long a live read may block before the stop flag is checked again.
    pub read_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            max_lifetime_secs: 1800,
            scan_interval_secs: 1,
            scan_every_packets: None,
            mode: None,
            capture_clock_expiry: false,
            read_timeout_ms: 250,
        }
    }
}

impl FlowConfig {
    /// Layers an optional config file under `FLOWMETER__*` environment variables.
    pub fn load(config_path: &str) -> Result<Self> {
        let cfg: FlowConfig = ConfigBuilder::<DefaultState>::default()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix(DEFAULT_ENV_VAR_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("max_lifetime_secs", self.max_lifetime_secs),
            ("scan_interval_secs", self.scan_interval_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(FlowError::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_TIMEOUT_SECS, value
                )));
            }
        }
        if self.scan_every_packets == Some(0) {
            return Err(FlowError::Config("scan_every_packets must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(FlowError::Config("read_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> TimeDelta {
        TimeDelta::seconds(self.idle_timeout_secs as i64)
    }

    pub fn max_lifetime(&self) -> TimeDelta {
        TimeDelta::seconds(self.max_lifetime_secs as i64)
    }

    pub fn scan_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.scan_interval_secs as i64)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
