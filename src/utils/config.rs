//! Run configuration loaded from TOML.
//!
//! Model shapes live in the burn `Config` structs next to each model; this
//! file covers how a run is evaluated and where its metrics go.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{ProbeError, Result};
use super::logging::{init_logging, LogConfig};
use super::sink::{FileSink, MemorySink, MetricSink, TracingSink};

/// Learning rate handed to the optimizer
pub const DEFAULT_LEARNING_RATE: f64 = 3e-4;

/// Foreground pixel count above which a mask counts as a positive sample
pub const DEFAULT_PIXEL_THRESHOLD: usize = 1000;

/// Upper bound on batches buffered for the epoch-end reference score
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Where epoch metrics are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Memory,
    Tracing,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub learning_rate: f64,
    pub pixel_threshold: usize,
    /// Maximum batches buffered per phase; 0 disables the bound
    pub buffer_capacity: usize,
    pub sink: SinkKind,
    pub output_dir: PathBuf,
    pub log: LogConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            sink: SinkKind::Tracing,
            output_dir: PathBuf::from("runs"),
            log: LogConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProbeError::Config(format!("Failed to read config {}: {e}", path.display())))?;

        let config: RunConfig = toml::from_str(&content)
            .map_err(|e| ProbeError::Config(format!("Failed to parse config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProbeError::Serialization(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(ProbeError::Config("learning_rate must be positive".to_string()));
        }
        Ok(())
    }

    /// Buffer bound as an option, `None` when unbounded
    pub fn buffer_limit(&self) -> Option<usize> {
        (self.buffer_capacity > 0).then_some(self.buffer_capacity)
    }

    /// Install the `[log]` section as the global subscriber
    pub fn install_logging(&self) -> Result<()> {
        init_logging(&self.log)
    }

    /// Build the configured sink
    pub fn build_sink(&self) -> Result<Box<dyn MetricSink>> {
        Ok(match self.sink {
            SinkKind::Memory => Box::new(MemorySink::new()),
            SinkKind::Tracing => Box::new(TracingSink),
            SinkKind::File => Box::new(FileSink::create(&self.output_dir)?),
        })
    }
}
