//! Destinations for exported rows.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{FlowError, Result};
use crate::export::{FeatureRow, FlowReport};
use crate::flow::CompletedFlow;

/// Receives rows in flow-completion order.
pub trait RowSink {
    fn accept(&mut self, flow: &CompletedFlow, row: &FeatureRow) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: RowSink + ?Sized> RowSink for Box<S> {
    fn accept(&mut self, flow: &CompletedFlow, row: &FeatureRow) -> Result<()> {
        (**self).accept(flow, row)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub flows: Vec<CompletedFlow>,
    pub rows: Vec<FeatureRow>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowSink for VecSink {
    fn accept(&mut self, flow: &CompletedFlow, row: &FeatureRow) -> Result<()> {
        self.flows.push(flow.clone());
        self.rows.push(*row);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// `bytes,packets,duration` only.
    Features,
    /// Flow identity, counters and end reason before the features.
    Detailed,
}

pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    format: RowFormat,
}

impl CsvSink<File> {
    pub fn create(path: &Path, format: RowFormat) -> Result<Self> {
        Ok(Self {
            writer: csv::Writer::from_path(path)?,
            format,
        })
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W, format: RowFormat) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            format,
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| FlowError::Io(std::io::Error::new(e.error().kind(), e.error().to_string())))
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn accept(&mut self, flow: &CompletedFlow, row: &FeatureRow) -> Result<()> {
        match self.format {
            RowFormat::Features => self.writer.serialize(row)?,
            RowFormat::Detailed => self.writer.serialize(FlowReport::new(flow, row))?,
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
