//! # Probe Heads
//!
//! Classification and segmentation heads trained on top of a frozen
//! upstream encoder, built on the Burn framework.
//!
//! ## Features
//!
//! - **Linear probe** over precomputed embeddings, or over images through an optional (frozen) encoder
//! - **UNETR-style decoder** fusing a five-level feature pyramid into full-resolution logits
//! - **Epoch metric protocol**: accuracy, recall, F1, precision, specificity, confusion matrix,
//!   Dice and a whole-epoch reference F-score, reported through a pluggable sink
//! - **Phase handlers** that any scheduler can drive, plus a reference driver with AdamW that
//!   evaluates on the inference copy of the model
//!
//! ## Modules
//!
//! - `model`: Decoder blocks, the UNETR decoder, the encoder and the linear probe
//! - `training`: Phase handler contract, batch validation, losses, aggregation and tasks
//! - `utils`: Logging, metrics, sinks, heatmap rendering, configuration and errors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use probe_heads::model::UnetrDecoderConfig;
//! use probe_heads::training::{configure_optimizers, Phase, PhaseRunner, SegmentationTask};
//! use probe_heads::utils::RunConfig;
//!
//! let config = RunConfig::load("run.toml".as_ref())?;
//! config.install_logging()?;
//! let decoder = UnetrDecoderConfig::new(768, 1, 3).init(&device);
//! let task = SegmentationTask::new(decoder, config.build_sink()?, &config);
//! let mut runner = PhaseRunner::new(task, configure_optimizers());
//! runner.run_epoch(train_batches, val_batches)?;
//! ```

pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use model::{
    ClassificationModel, ClassificationModelConfig, ConvEncoder, ConvEncoderConfig,
    FeaturePyramid, UnetrDecoder, UnetrDecoderConfig,
};
pub use training::{
    configure_optimizers, BatchRecord, ClassificationTask, EpochAggregator, EpochReport,
    EvalPhaseHandler, Phase, PhaseRunner, SegmentationTask, TrainablePhaseHandler,
};
pub use utils::error::{ProbeError, Result};
pub use utils::metrics::{BinaryStatScores, ConfusionMatrix2x2};
pub use utils::sink::MetricSink;
