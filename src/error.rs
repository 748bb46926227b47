//! Error types for benchmark runs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors raised while preparing or driving the inference pipeline
#[derive(Debug, Error)]
pub enum BenchError {
    /// I/O error on the model or cache directory
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// A required model file is missing
    #[error("{what} not found in {path}")]
    ModelNotFound {
        /// Directory that was searched
        path: PathBuf,
        /// Which file was expected
        what: &'static str,
    },

    /// Device identifier could not be parsed
    #[error("Unknown device '{name}' (expected CPU, GPU, CUDA, CUDA:<n> or METAL)")]
    UnknownDevice {
        /// The identifier as given
        name: String,
    },

    /// Device was parsed but is not usable on this machine or build
    #[error("Device {device} is not available: {reason}")]
    DeviceUnavailable {
        /// Display form of the requested device
        device: String,
        /// Why it could not be opened
        reason: String,
    },

    /// Failure inside the inference engine
    #[error("Engine error during {stage}: {reason}")]
    Engine {
        /// Pipeline stage that failed (load, prefill, decode, ...)
        stage: &'static str,
        /// Reason for failure
        reason: String,
    },

    /// Tokenizer load, encode or decode failed
    #[error("Tokenizer error: {reason}")]
    Tokenizer {
        /// Reason for failure
        reason: String,
    },

    /// Model download from the hub failed
    #[error("Download failed: {reason}")]
    Download {
        /// Reason for failure
        reason: String,
    },
}

impl BenchError {
    /// Create an engine error for the given stage
    pub fn engine(stage: &'static str, reason: impl ToString) -> Self {
        Self::Engine {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer(reason: impl ToString) -> Self {
        Self::Tokenizer {
            reason: reason.to_string(),
        }
    }

    /// Create a model-not-found error
    pub fn model_not_found(path: impl Into<PathBuf>, what: &'static str) -> Self {
        Self::ModelNotFound {
            path: path.into(),
            what,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::model_not_found("/models/x", "tokenizer.json");
        assert_eq!(err.to_string(), "tokenizer.json not found in /models/x");

        let err = BenchError::engine("prefill", "out of memory");
        assert_eq!(err.to_string(), "Engine error during prefill: out of memory");

        let err = BenchError::DeviceUnavailable {
            device: "GPU".to_string(),
            reason: "no CUDA or Metal device found".to_string(),
        };
        assert_eq!(err.to_string(), "Device GPU is not available: no CUDA or Metal device found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BenchError = io.into();
        assert!(matches!(err, BenchError::Io { .. }));
    }
}
