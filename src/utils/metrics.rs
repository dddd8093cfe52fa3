//! Metrics Module for Binary Evaluation
//!
//! Provides the binary metrics reported at every validation and test epoch:
//! - Accuracy, Precision, Recall, Specificity, F1-score
//! - 2x2 Confusion Matrix
//! - Pixel overlap (Dice) from the same running counts
//! - Reference F-score recomputed over a whole epoch of logits

use serde::{Deserialize, Serialize};

use super::error::{ProbeError, Result};

/// Probability above which a prediction counts as positive
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Running true/false positive/negative counts for a binary task.
///
/// These are the sufficient statistics for every scalar metric reported at
/// epoch end, so folding a batch in is the whole per-batch cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryStatScores {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl BinaryStatScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of probabilities and binary targets into the counts.
    ///
    /// Predictions are positive when strictly above `threshold`; targets are
    /// positive when at least 0.5.
    pub fn update(&mut self, probabilities: &[f32], targets: &[f32], threshold: f32) -> Result<()> {
        if probabilities.len() != targets.len() {
            return Err(ProbeError::LengthMismatch {
                predictions: probabilities.len(),
                targets: targets.len(),
            });
        }

        for (&p, &t) in probabilities.iter().zip(targets.iter()) {
            match (p > threshold, t >= 0.5) {
                (true, true) => self.true_positives += 1,
                (true, false) => self.false_positives += 1,
                (false, false) => self.true_negatives += 1,
                (false, true) => self.false_negatives += 1,
            }
        }

        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// TN / (TN + FP)
    pub fn specificity(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_positives)
    }

    /// 2TP / (2TP + FP + FN); zero when there is nothing positive on either side
    pub fn f1(&self) -> f64 {
        ratio(
            2 * self.true_positives,
            2 * self.true_positives + self.false_positives + self.false_negatives,
        )
    }

    /// Overlap score of predicted and true foreground. Same formula as F1,
    /// except that an epoch with no foreground on either side scores 1,
    /// as the smoothed [`FScore`] does.
    pub fn dice(&self) -> f64 {
        if self.true_positives + self.false_positives + self.false_negatives == 0 {
            return 1.0;
        }
        self.f1()
    }

    pub fn confusion_matrix(&self) -> ConfusionMatrix2x2 {
        ConfusionMatrix2x2 {
            cells: [
                [self.true_negatives, self.false_positives],
                [self.false_negatives, self.true_positives],
            ],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Confusion matrix for a binary task (row = actual, column = predicted)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix2x2 {
    pub cells: [[u64; 2]; 2],
}

impl ConfusionMatrix2x2 {
    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> u64 {
        self.cells[actual][predicted]
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().flatten().sum()
    }

    pub fn max(&self) -> u64 {
        self.cells.iter().flatten().copied().max().unwrap_or(0)
    }

    /// Cells in row-major order with their (actual, predicted) coordinates
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, u64)> + '_ {
        (0..2).flat_map(move |i| (0..2).map(move |j| (i, j, self.cells[i][j])))
    }
}

impl std::fmt::Display for ConfusionMatrix2x2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Confusion Matrix (rows=actual, cols=predicted):")?;
        writeln!(f, "        {:>8} {:>8}", 0, 1)?;
        for (row, cells) in self.cells.iter().enumerate() {
            writeln!(f, "{:>6}  {:>8} {:>8}", row, cells[0], cells[1])?;
        }
        Ok(())
    }
}

/// F-score over raw logits, matching the usual segmentation-library
/// definition: sigmoid activation, hard threshold, smoothed ratio.
#[derive(Debug, Clone, Copy)]
pub struct FScore {
    pub beta: f64,
    pub eps: f64,
    pub threshold: f32,
}

impl Default for FScore {
    fn default() -> Self {
        Self {
            beta: 1.0,
            eps: 1e-7,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FScore {
    /// Targets are binarized at 0.5, like [`BinaryStatScores::update`]
    pub fn compute(&self, logits: &[f32], targets: &[f32]) -> Result<f64> {
        if logits.len() != targets.len() {
            return Err(ProbeError::LengthMismatch {
                predictions: logits.len(),
                targets: targets.len(),
            });
        }

        let mut tp = 0.0f64;
        let mut predicted = 0.0f64;
        let mut actual = 0.0f64;
        for (&x, &t) in logits.iter().zip(targets.iter()) {
            let pred = if sigmoid(x) > self.threshold { 1.0 } else { 0.0 };
            let gt = if t >= 0.5 { 1.0 } else { 0.0 };
            tp += pred * gt;
            predicted += pred;
            actual += gt;
        }
        let fp = predicted - tp;
        let fn_ = actual - tp;

        let b2 = self.beta * self.beta;
        Ok(((1.0 + b2) * tp + self.eps) / ((1.0 + b2) * tp + b2 * fn_ + fp + self.eps))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Running average for tracking per-batch losses
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}
