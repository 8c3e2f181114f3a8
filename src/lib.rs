//! Bidirectional flow reconstruction from packet captures, exported as
//! fixed-schema feature rows.

pub mod classify;
pub mod config;
pub mod error;
pub mod export;
pub mod flow;
pub mod packet;
pub mod scheduler;
pub mod sink;
pub mod source;

#[cfg(test)]
mod testutil;

pub use config::{CaptureMode, FlowConfig};
pub use error::{FlowError, Result};
pub use export::{FeatureExporter, FeatureRow, FEATURE_COLUMNS, FEATURE_SCHEMA_VERSION};
pub use flow::{CompletedFlow, EndReason, FlowKey, FlowTable};
pub use scheduler::{run, ExpirationScheduler, SessionReport};
pub use sink::{CsvSink, RowFormat, RowSink, VecSink};
pub use source::{CaptureSource, PacketSource, StopSignal};
