//! Training module for the probe heads
//!
//! This module provides:
//! - The phase-handler contract an external scheduler drives
//! - Typed batch validation
//! - Pluggable losses
//! - Epoch metric aggregation and reporting
//! - The classification and segmentation tasks
//! - A reference driver running phases with an AdamW optimizer
//!
//! ## Phase Protocol
//!
//! For every epoch and phase the scheduler calls:
//! 1. `begin_phase(phase)`
//! 2. `on_batch(phase, batch)` once per batch, receiving the loss
//! 3. `on_phase_end(phase)`, which reduces and reports validation/test metrics
//!
//! On an autodiff backend, validation and test batches go through
//! [`EvalPhaseHandler::on_eval_batch`] instead, which runs the inference copy
//! of the model.

pub mod aggregator;
pub mod batch;
pub mod classification;
pub mod loss;
pub mod runner;
pub mod segmentation;

use std::fmt;

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};

use crate::utils::error::Result;

// Re-export main types for convenience
pub use aggregator::{EpochAggregator, EpochReport};
pub use batch::{BatchRecord, Embeddings};
pub use classification::ClassificationTask;
pub use loss::{BceWithLogitsLoss, GeneralizedDiceLoss, LossFn};
pub use runner::{PhaseRunner, PhaseSummary};
pub use segmentation::SegmentationTask;

pub use crate::utils::config::DEFAULT_LEARNING_RATE;

/// AdamW weight decay
pub const DEFAULT_WEIGHT_DECAY: f32 = 1e-2;

/// Stage of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Val,
    Test,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
        }
    }

    /// Prefix of every metric logged in this phase
    pub fn prefix(&self) -> &'static str {
        match self {
            Phase::Train => "train_",
            Phase::Val => "val_",
            Phase::Test => "test_",
        }
    }

    /// Whether batches of this phase feed the epoch metrics
    pub fn aggregates(&self) -> bool {
        !matches!(self, Phase::Train)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contract between a model variant and whatever schedules its epochs.
///
/// The scheduler owns batch iteration, gradients and optimizer steps; the
/// handler owns its model, its loss, its per-phase metric state and its
/// reporting sink.
pub trait TrainablePhaseHandler<B: Backend> {
    type Model: Module<B>;

    fn model(&self) -> &Self::Model;

    /// Replace the model, e.g. after an optimizer step
    fn set_model(&mut self, model: Self::Model);

    /// Learning rate handed to the optimizer
    fn learning_rate(&self) -> f64 {
        DEFAULT_LEARNING_RATE
    }

    /// Prepare per-phase state for a new epoch
    fn begin_phase(&mut self, phase: Phase) -> Result<()>;

    /// Process one batch and return its loss
    fn on_batch(&mut self, phase: Phase, batch: BatchRecord<B>) -> Result<Tensor<B, 1>>;

    /// Close the phase; evaluation phases return their epoch report
    fn on_phase_end(&mut self, phase: Phase) -> Result<Option<EpochReport>>;
}

/// Evaluation on the inference copy of an autodiff model.
///
/// [`AutodiffModule::valid`] drops gradient tracking, so batch norm layers
/// normalize with their running statistics and leave them untouched.
pub trait EvalPhaseHandler<B: AutodiffBackend>: TrainablePhaseHandler<B> {
    /// Process one validation or test batch and return its (detached) loss
    fn on_eval_batch(&mut self, phase: Phase, batch: BatchRecord<B>) -> Result<Tensor<B, 1>>;
}

/// AdamW over every trainable parameter of `M`
pub fn configure_optimizers<B, M>() -> impl Optimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    AdamWConfig::new()
        .with_weight_decay(DEFAULT_WEIGHT_DECAY)
        .with_epsilon(1e-8)
        .init()
}
