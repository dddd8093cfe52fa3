//! Error Handling Module
//!
//! Defines the error type shared by the decoder, the batch contracts and the
//! epoch metric protocol. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Main error type for probe-heads operations
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Two tensors meeting at a merge point disagree on their shape
    #[error("Shape mismatch at {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A batch record lacks a field the task requires
    #[error("Batch is missing required field '{0}'")]
    MissingField(&'static str),

    /// A segmentation batch lacks one of the pyramid stages
    #[error("Batch embeddings are missing stage '{0}'")]
    MissingStage(String),

    /// Epoch reduction was requested without any accumulated batch
    #[error("No samples accumulated for {0} before epoch end")]
    EmptyEpoch(String),

    /// Predictions and targets handed to a metric differ in length
    #[error("Length mismatch: {predictions} predictions vs {targets} targets")]
    LengthMismatch { predictions: usize, targets: usize },

    /// The epoch output buffer reached its configured capacity
    #[error("Epoch buffer is full ({0} batches)")]
    BufferFull(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor data could not be read back to the host
    #[error("Tensor data error: {0}")]
    Data(String),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for ProbeError {
    fn from(err: image::ImageError) -> Self {
        ProbeError::Image(err.to_string())
    }
}

/// Convenience Result type for probe-heads operations
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProbeError::Data(format!("{}: {:?}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| ProbeError::Data(format!("{}: {:?}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProbeError::MissingField("embs");
        assert_eq!(format!("{}", err), "Batch is missing required field 'embs'");
    }

    #[test]
    fn test_shape_mismatch_names_stage() {
        let err = ProbeError::ShapeMismatch {
            stage: "decoder0_header",
            expected: vec![256, 256],
            actual: vec![512, 512],
        };
        let msg = err.to_string();
        assert!(msg.contains("decoder0_header"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, String> = Err("bad dtype".to_string());
        let with_context = result.context("Failed to read logits");
        assert!(matches!(with_context, Err(ProbeError::Data(_))));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProbeError = io_err.into();
        assert!(matches!(err, ProbeError::Io(_)));
    }
}
