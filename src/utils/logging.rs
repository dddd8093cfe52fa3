//! Logging Module
//!
//! Structured logging through the `tracing` crate. Nothing is configured at
//! load time: callers build a [`LogConfig`] and install it with [`init_logging`].

use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use super::error::{ProbeError, Result};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProbeError::Config(format!("unknown log level '{}'", other))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Install a global subscriber built from `config`.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ProbeError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Times one phase of one epoch and reports it on completion
pub struct PhaseLogger {
    phase: String,
    epoch: usize,
    batches: usize,
    start: Instant,
}

impl PhaseLogger {
    pub fn start(phase: &str, epoch: usize) -> Self {
        tracing::info!("Epoch {} {} phase started", epoch + 1, phase);
        Self {
            phase: phase.to_string(),
            epoch,
            batches: 0,
            start: Instant::now(),
        }
    }

    pub fn batch_done(&mut self, loss: f64) {
        self.batches += 1;
        if self.batches % 10 == 0 {
            tracing::debug!(
                "  {} batch {}: loss = {:.4}",
                self.phase,
                self.batches,
                loss
            );
        }
    }

    pub fn finish(&self, mean_loss: f64) {
        tracing::info!(
            "Epoch {} {} phase completed in {:.2}s | {} batches | mean loss {:.4}",
            self.epoch + 1,
            self.phase,
            self.start.elapsed().as_secs_f64(),
            self.batches,
            mean_loss
        );
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.ansi_colors);
    }

    #[test]
    fn test_phase_logger_counts_batches() {
        let mut logger = PhaseLogger::start("val", 0);
        logger.batch_done(0.5);
        logger.batch_done(0.4);
        assert_eq!(logger.batches(), 2);
    }
}
