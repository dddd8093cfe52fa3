//! Reporting sinks
//!
//! A [`MetricSink`] receives named scalars and rendered figures. Tasks get
//! their sink injected at construction, so where metrics end up is decided
//! by whoever builds the task.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::charts::Figure;
use super::error::Result;

/// Destination for scalar and image emissions
pub trait MetricSink {
    fn log_scalar(&mut self, name: &str, value: f64) -> Result<()>;

    fn log_image(&mut self, name: &str, figure: &Figure) -> Result<()>;
}

/// A recorded emission
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Scalar { name: String, value: f64 },
    Image { name: String, title: String },
}

/// Sink that keeps every emission in memory.
///
/// Clones share the same record, so a caller can hand one clone to a task
/// and inspect the other. A panic while the record is locked cannot leave
/// it half-written, so a poisoned lock is recovered on both the write and
/// the read side.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Emission>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.records().clone()
    }

    /// Most recent value logged under `name`
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.emissions().into_iter().rev().find_map(|e| match e {
            Emission::Scalar { name: n, value } if n == name => Some(value),
            _ => None,
        })
    }

    pub fn image_names(&self) -> Vec<String> {
        self.emissions()
            .into_iter()
            .filter_map(|e| match e {
                Emission::Image { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn records(&self) -> MutexGuard<'_, Vec<Emission>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, emission: Emission) -> Result<()> {
        self.records().push(emission);
        Ok(())
    }
}

impl MetricSink for MemorySink {
    fn log_scalar(&mut self, name: &str, value: f64) -> Result<()> {
        self.push(Emission::Scalar {
            name: name.to_string(),
            value,
        })
    }

    fn log_image(&mut self, name: &str, figure: &Figure) -> Result<()> {
        self.push(Emission::Image {
            name: name.to_string(),
            title: figure.title.clone(),
        })
    }
}

/// Sink that writes structured log lines only
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_scalar(&mut self, name: &str, value: f64) -> Result<()> {
        info!(metric = name, value, "scalar");
        Ok(())
    }

    fn log_image(&mut self, name: &str, figure: &Figure) -> Result<()> {
        info!(metric = name, title = %figure.title, "image");
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    timestamp: String,
    name: &'a str,
    value: f64,
}

/// Sink that appends scalars to `metrics.jsonl` and saves figures as
/// SVG/PNG pairs under `images/` inside a run directory.
pub struct FileSink {
    dir: PathBuf,
    scalars: File,
    image_counter: usize,
}

impl FileSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join("images"))?;
        let scalars = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;

        info!("Writing metrics to {:?}", dir);

        Ok(Self {
            dir: dir.to_path_buf(),
            scalars,
            image_counter: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MetricSink for FileSink {
    fn log_scalar(&mut self, name: &str, value: f64) -> Result<()> {
        let record = ScalarRecord {
            timestamp: Utc::now().to_rfc3339(),
            name,
            value,
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.scalars, "{}", line)?;
        Ok(())
    }

    fn log_image(&mut self, name: &str, figure: &Figure) -> Result<()> {
        let stem = format!("{}_{:04}", name, self.image_counter);
        self.image_counter += 1;
        figure.save(&self.dir.join("images"), &stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::charts::render_confusion_heatmap;
    use crate::utils::metrics::ConfusionMatrix2x2;

    #[test]
    fn test_memory_sink_shares_records() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();

        handle.log_scalar("val_f1", 0.5).unwrap();
        handle.log_scalar("val_f1", 0.75).unwrap();

        assert_eq!(sink.scalar("val_f1"), Some(0.75));
        assert_eq!(sink.emissions().len(), 2);
    }

    #[test]
    fn test_memory_sink_recovers_poisoned_lock() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        handle.log_scalar("val_f1", 0.5).unwrap();

        let holder = sink.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = holder.records.lock().unwrap();
            panic!("panic while holding the record");
        })
        .join();
        assert!(panicked.is_err());
        assert!(sink.records.is_poisoned());

        // Writes and reads agree on what was recorded
        handle.log_scalar("val_f1", 0.25).unwrap();
        assert_eq!(sink.emissions().len(), 2);
        assert_eq!(sink.scalar("val_f1"), Some(0.25));
    }

    #[test]
    fn test_file_sink_writes_scalars_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path()).unwrap();

        sink.log_scalar("val_accuracy", 0.9).unwrap();
        let figure = render_confusion_heatmap(&ConfusionMatrix2x2::default(), "Confusion Matrix");
        sink.log_image("val_confusion_matrix", &figure).unwrap();

        let content = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        assert!(content.contains("\"name\":\"val_accuracy\""));
        assert!(dir.path().join("images/val_confusion_matrix_0000.svg").exists());
        assert!(dir.path().join("images/val_confusion_matrix_0000.png").exists());
    }

    #[test]
    fn test_tracing_sink_accepts_everything() {
        let mut sink = TracingSink;
        sink.log_scalar("test_f1", 1.0).unwrap();
    }
}
