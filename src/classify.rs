//! Hook for feeding feature rows to a trained model.
//!
//! No model ships with the crate. Callers bring a `Classifier`; the sink
//! aligns each batch to the width the model was trained on and tallies the
//! predicted labels.

use log::{debug, info};
use ndarray::{Array2, ArrayView2};

use crate::error::{FlowError, Result};
use crate::export::FeatureRow;
use crate::flow::CompletedFlow;
use crate::sink::RowSink;

pub const DEFAULT_BATCH_SIZE: usize = 64;

pub trait Classifier {
    /// Number of input columns the model was fitted on.
    fn expected_width(&self) -> usize;

    /// One prediction per input row.
    fn predict(&mut self, features: ArrayView2<f64>) -> Result<Vec<f64>>;
}

/// Builds a `rows x width` matrix, padding missing columns with zeros or
/// dropping extra ones from the right.
pub fn align_features(rows: &[FeatureRow], width: usize) -> Array2<f64> {
    let mut matrix = Array2::<f64>::zeros((rows.len(), width));
    for (i, row) in rows.iter().enumerate() {
        for (j, value) in row.to_vector().into_iter().take(width).enumerate() {
            matrix[[i, j]] = value;
        }
    }
    matrix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Normal,
    Attack,
    Other(i64),
}

impl Label {
    pub fn from_prediction(value: f64) -> Self {
        match value.round() as i64 {
            0 => Label::Normal,
            1 => Label::Attack,
            n => Label::Other(n),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    pub total: u64,
    pub normal: u64,
    pub attack: u64,
    pub other: u64,
}

impl DetectionSummary {
    pub fn record(&mut self, label: Label) {
        self.total += 1;
        match label {
            Label::Normal => self.normal += 1,
            Label::Attack => self.attack += 1,
            Label::Other(_) => self.other += 1,
        }
    }

    /// Share of attack predictions in percent, two decimals.
    pub fn attack_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.attack as f64 * 100.0 / self.total as f64;
        (pct * 100.0).round() / 100.0
    }
}

/// Classifies rows in fixed-size batches as they arrive.
pub struct ClassifierSink<C: Classifier> {
    classifier: C,
    batch: Vec<FeatureRow>,
    batch_size: usize,
    labels: Vec<Label>,
    summary: DetectionSummary,
}

impl<C: Classifier> ClassifierSink<C> {
    pub fn new(classifier: C) -> Self {
        Self::with_batch_size(classifier, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(classifier: C, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            classifier,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            labels: Vec::new(),
            summary: DetectionSummary::default(),
        }
    }

    pub fn summary(&self) -> &DetectionSummary {
        &self.summary
    }

    /// Labels in row order for every batch classified so far.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    fn classify_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let features = align_features(&self.batch, self.classifier.expected_width());
        let predictions = self.classifier.predict(features.view())?;
        if predictions.len() != self.batch.len() {
            return Err(FlowError::Classifier(format!(
                "expected {} predictions, got {}",
                self.batch.len(),
                predictions.len()
            )));
        }

        for label in predictions.into_iter().map(Label::from_prediction) {
            self.summary.record(label);
            self.labels.push(label);
        }
        debug!("Classified batch of {} rows", self.batch.len());
        self.batch.clear();
        Ok(())
    }
}

impl<C: Classifier> RowSink for ClassifierSink<C> {
    fn accept(&mut self, _flow: &CompletedFlow, row: &FeatureRow) -> Result<()> {
        self.batch.push(*row);
        if self.batch.len() >= self.batch_size {
            self.classify_batch()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.classify_batch()?;
        info!(
            "{} flows classified, {} attack ({}%)",
            self.summary.total,
            self.summary.attack,
            self.summary.attack_percentage()
        );
        Ok(())
    }
}
