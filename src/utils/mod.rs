//! Utilities module for logging, metrics, reporting and configuration
//!
//! This module provides:
//! - Structured logging with tracing
//! - Binary metrics (accuracy, F1-score, specificity, confusion matrix, Dice)
//! - Confusion-matrix heatmap rendering
//! - Metric sinks (memory, tracing, file)
//! - Error handling types and run configuration

pub mod charts;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod sink;
pub mod tensor;

// Re-export main types for convenience
pub use charts::{render_confusion_heatmap, Figure};
pub use config::RunConfig;
pub use error::{ProbeError, Result};
pub use logging::{init_logging, LogConfig};
pub use metrics::{BinaryStatScores, ConfusionMatrix2x2, FScore};
pub use sink::{FileSink, MemorySink, MetricSink, TracingSink};
pub use tensor::HostTensor;
