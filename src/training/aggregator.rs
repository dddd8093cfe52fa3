//! Epoch metric aggregation
//!
//! One [`EpochAggregator`] per evaluation phase folds every batch into
//! running binary counts and, at epoch end, reduces them to the reported
//! metrics. Lifecycle:
//!
//! ```text
//! Idle --begin()/first update--> Accumulating --end()--> Idle
//! ```
//!
//! `end()` always leaves the aggregator idle and empty, whether the
//! reduction succeeds or not.
//!
//! Segmentation additionally tracks pixel overlap (Dice) and buffers raw
//! logits/targets so the reference F-score can be recomputed over the whole
//! epoch and compared with the incremental value.

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Phase;
use crate::utils::charts::render_confusion_heatmap;
use crate::utils::error::{ProbeError, Result};
use crate::utils::metrics::{BinaryStatScores, ConfusionMatrix2x2, FScore, DEFAULT_THRESHOLD};
use crate::utils::sink::MetricSink;
use crate::utils::tensor::{to_host_vec, HostTensor};

/// Title of the emitted heatmap
pub const CONFUSION_MATRIX_TITLE: &str = "Confusion Matrix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Accumulating,
}

/// Detached host copies of every `(logits, targets)` pair seen this epoch
#[derive(Debug, Clone, Default)]
pub struct EpochBuffer {
    logits: Vec<HostTensor>,
    targets: Vec<HostTensor>,
    capacity: Option<usize>,
}

impl EpochBuffer {
    /// `capacity` bounds the number of buffered batches; `None` is unbounded
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            logits: Vec::new(),
            targets: Vec::new(),
            capacity,
        }
    }

    /// Fails with `BufferFull` when one more batch would not fit
    pub fn ensure_room(&self) -> Result<()> {
        match self.capacity {
            Some(capacity) if self.logits.len() >= capacity => Err(ProbeError::BufferFull(capacity)),
            _ => Ok(()),
        }
    }

    pub fn push(&mut self, logits: HostTensor, targets: HostTensor) -> Result<()> {
        self.ensure_room()?;
        self.logits.push(logits);
        self.targets.push(targets);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }

    /// Concatenate everything buffered and empty the buffer
    pub fn drain(&mut self) -> Result<Option<(HostTensor, HostTensor)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let logits = HostTensor::cat(&std::mem::take(&mut self.logits));
        let targets = HostTensor::cat(&std::mem::take(&mut self.targets));
        Ok(Some((logits?, targets?)))
    }

    pub fn clear(&mut self) {
        self.logits.clear();
        self.targets.clear();
    }
}

/// Metrics of one phase over one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub phase: String,
    /// Samples folded into the binary metrics
    pub samples: u64,
    pub accuracy: f64,
    pub recall: f64,
    pub f1: f64,
    pub precision: f64,
    pub specificity: f64,
    pub confusion: ConfusionMatrix2x2,
    /// Pixel-level Dice, when overlap was tracked
    pub dice: Option<f64>,
    /// F-score recomputed from the buffered logits, when any were buffered
    pub reference_fscore: Option<f64>,
}

impl EpochReport {
    /// Absolute gap between the reference F-score and the incremental
    /// metric it recomputes (Dice if tracked, otherwise F1)
    pub fn reference_delta(&self) -> Option<f64> {
        self.reference_fscore
            .map(|reference| (reference - self.dice.unwrap_or(self.f1)).abs())
    }

    /// Named scalars in emission order
    pub fn scalars(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut scalars = vec![
            (format!("{prefix}accuracy"), self.accuracy),
            (format!("{prefix}recall"), self.recall),
            (format!("{prefix}f1"), self.f1),
            (format!("{prefix}precision"), self.precision),
            (format!("{prefix}specificity"), self.specificity),
        ];
        for (i, j, count) in self.confusion.iter() {
            scalars.push((format!("{prefix}confusion_matrix_{i}_{j}"), count as f64));
        }
        if let Some(dice) = self.dice {
            scalars.push((format!("{prefix}dsc"), dice));
        }
        if let (Some(reference), Some(delta)) = (self.reference_fscore, self.reference_delta()) {
            scalars.push((format!("{prefix}smp"), reference));
            scalars.push((format!("{prefix}smp_delta"), delta));
        }
        scalars
    }

    /// Send scalars and the confusion-matrix heatmap to `sink`
    pub fn emit(&self, prefix: &str, sink: &mut dyn MetricSink) -> Result<()> {
        for (name, value) in self.scalars(prefix) {
            sink.log_scalar(&name, value)?;
        }

        let figure = render_confusion_heatmap(&self.confusion, CONFUSION_MATRIX_TITLE);
        sink.log_image(&format!("{prefix}confusion_matrix"), &figure)?;
        Ok(())
    }
}

/// Accumulate-then-reduce metric state for one phase
#[derive(Debug, Clone)]
pub struct EpochAggregator {
    phase: String,
    state: AggregatorState,
    stats: BinaryStatScores,
    overlap: Option<BinaryStatScores>,
    buffer: EpochBuffer,
    reference: FScore,
}

impl EpochAggregator {
    pub fn new(phase: &str, buffer_capacity: Option<usize>) -> Self {
        Self {
            phase: phase.to_string(),
            state: AggregatorState::Idle,
            stats: BinaryStatScores::new(),
            overlap: None,
            buffer: EpochBuffer::new(buffer_capacity),
            reference: FScore::default(),
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// True when nothing has been folded in or buffered
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.overlap.is_none() && self.buffer.is_empty()
    }

    pub fn buffered_batches(&self) -> usize {
        self.buffer.len()
    }

    /// Start a new epoch, dropping anything left from an unfinished one
    pub fn begin(&mut self) {
        if self.state == AggregatorState::Accumulating && !self.is_empty() {
            warn!("{}: discarding partial epoch ({} samples)", self.phase, self.stats.total());
        }
        self.reset();
        self.state = AggregatorState::Accumulating;
    }

    /// Fold thresholded probabilities and binary targets into the counts
    pub fn update<B: Backend, const D: usize>(
        &mut self,
        probabilities: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Result<()> {
        let probabilities = to_host_vec(probabilities.detach())?;
        let targets = to_host_vec(targets.detach())?;
        self.update_host(&probabilities, &targets)
    }

    pub fn update_host(&mut self, probabilities: &[f32], targets: &[f32]) -> Result<()> {
        self.ensure_started();
        self.stats.update(probabilities, targets, DEFAULT_THRESHOLD)
    }

    /// Fold pixel-level overlap between a predicted probability map and the
    /// ground-truth mask, both `[batch, channels, h, w]`.
    ///
    /// With more than one channel, channel 0 is treated as background and
    /// left out.
    pub fn update_overlap<B: Backend>(
        &mut self,
        probabilities: Tensor<B, 4>,
        mask: Tensor<B, 4>,
    ) -> Result<()> {
        let [batch, channels, height, width] = probabilities.dims();
        if mask.dims() != [batch, channels, height, width] {
            return Err(ProbeError::ShapeMismatch {
                stage: "overlap update",
                expected: vec![batch, channels, height, width],
                actual: mask.dims().to_vec(),
            });
        }

        let (probabilities, mask) = if channels > 1 {
            (
                probabilities.slice([0..batch, 1..channels, 0..height, 0..width]),
                mask.slice([0..batch, 1..channels, 0..height, 0..width]),
            )
        } else {
            (probabilities, mask)
        };

        let probabilities = to_host_vec(probabilities.detach())?;
        let mask = to_host_vec(mask.detach())?;

        self.ensure_started();
        self.overlap
            .get_or_insert_with(BinaryStatScores::new)
            .update(&probabilities, &mask, DEFAULT_THRESHOLD)
    }

    /// Fails with `BufferFull` if the next [`record_outputs`] would.
    ///
    /// Callers that fold a batch into several accumulators check this first
    /// so a rejected batch leaves every accumulator untouched.
    ///
    /// [`record_outputs`]: Self::record_outputs
    pub fn ensure_capacity(&self) -> Result<()> {
        self.buffer.ensure_room()
    }

    /// Buffer detached host copies of raw logits and targets for the
    /// epoch-end reference F-score
    pub fn record_outputs<B: Backend, const D: usize>(
        &mut self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Result<()> {
        self.ensure_started();
        self.buffer
            .push(HostTensor::capture(logits)?, HostTensor::capture(targets)?)
    }

    /// Reduce everything accumulated since `begin()` and return to idle
    pub fn end(&mut self) -> Result<EpochReport> {
        let report = self.reduce();
        self.reset();
        report
    }

    fn reduce(&mut self) -> Result<EpochReport> {
        if self.stats.is_empty() {
            return Err(ProbeError::EmptyEpoch(self.phase.clone()));
        }

        let reference_fscore = match self.buffer.drain()? {
            Some((logits, targets)) => {
                debug!(
                    "{}: reference F-score over {:?} logits",
                    self.phase, logits.shape
                );
                Some(self.reference.compute(&logits.values, &targets.values)?)
            }
            None => None,
        };

        let stats = &self.stats;
        let report = EpochReport {
            phase: self.phase.clone(),
            samples: stats.total(),
            accuracy: stats.accuracy(),
            recall: stats.recall(),
            f1: stats.f1(),
            precision: stats.precision(),
            specificity: stats.specificity(),
            confusion: stats.confusion_matrix(),
            dice: self.overlap.map(|overlap| overlap.dice()),
            reference_fscore,
        };

        info!(
            "{}: {} samples | acc {:.4} | f1 {:.4} | precision {:.4} | recall {:.4}",
            self.phase, report.samples, report.accuracy, report.f1, report.precision, report.recall
        );
        debug!("{}: {}", self.phase, report.confusion);
        if let Some(delta) = report.reference_delta() {
            debug!("{}: reference F-score delta {:.2e}", self.phase, delta);
        }

        Ok(report)
    }

    fn ensure_started(&mut self) {
        if self.state == AggregatorState::Idle {
            self.begin();
        }
    }

    fn reset(&mut self) {
        self.stats.reset();
        self.overlap = None;
        self.buffer.clear();
        self.state = AggregatorState::Idle;
    }
}

/// The validation and test aggregators owned by one task
#[derive(Debug, Clone)]
pub struct PhaseAggregators {
    pub val: EpochAggregator,
    pub test: EpochAggregator,
}

impl PhaseAggregators {
    pub fn new(buffer_capacity: Option<usize>) -> Self {
        Self {
            val: EpochAggregator::new(Phase::Val.name(), buffer_capacity),
            test: EpochAggregator::new(Phase::Test.name(), buffer_capacity),
        }
    }

    /// The aggregator for `phase`; training has none
    pub fn get_mut(&mut self, phase: Phase) -> Option<&mut EpochAggregator> {
        match phase {
            Phase::Train => None,
            Phase::Val => Some(&mut self.val),
            Phase::Test => Some(&mut self.test),
        }
    }

    /// Reduce `phase` and emit its report under the phase prefix
    pub fn finish(&mut self, phase: Phase, sink: &mut dyn MetricSink) -> Result<Option<EpochReport>> {
        let Some(aggregator) = self.get_mut(phase) else {
            return Ok(None);
        };
        let report = aggregator.end()?;
        report.emit(phase.prefix(), sink)?;
        Ok(Some(report))
    }
}
