//! Contract between the benchmark driver and the inference engine.
//!
//! The driver never looks inside a pipeline: it builds one from a model
//! directory, a [`Device`] and [`PipelineConfig`], then calls
//! [`Pipeline::generate`] once per prompt.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{BenchError, Result};
use crate::metrics::PerfMetrics;

/// Returned by the streaming callback after every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    /// Keep generating.
    Running,
    /// Stop and keep what was generated so far.
    Stop,
    /// Stop and discard the partial output.
    Cancel,
}

/// Callback invoked synchronously with each decoded text fragment.
pub type Streamer<'a> = &'a mut dyn FnMut(&str) -> StreamingStatus;

/// Target execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// First available accelerator (CUDA, then Metal).
    Gpu,
    Cuda(usize),
    Metal,
}

impl FromStr for Device {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "CPU" => Ok(Device::Cpu),
            "GPU" => Ok(Device::Gpu),
            "CUDA" => Ok(Device::Cuda(0)),
            "METAL" => Ok(Device::Metal),
            other => other
                .strip_prefix("CUDA:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| BenchError::UnknownDevice { name: s.to_string() }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu => write!(f, "GPU"),
            Device::Cuda(ordinal) => write!(f, "CUDA:{ordinal}"),
            Device::Metal => write!(f, "METAL"),
        }
    }
}

/// `GPU` when an accelerator backend was compiled in, `CPU` otherwise.
pub const DEFAULT_DEVICE: Device = if cfg!(any(feature = "cuda", feature = "metal")) {
    Device::Gpu
} else {
    Device::Cpu
};

/// Options applied when the pipeline is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// On-disk cache owned by the engine.
    pub cache_dir: PathBuf,
    /// Memory-map the weights file instead of reading it through a buffer.
    pub enable_mmap: bool,
}

/// Per-call generation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Sampling seed; generation is greedy so this only matters for ties.
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            seed: 42,
        }
    }
}

/// Output of one `generate` call.
#[derive(Debug, Clone, Default)]
pub struct DecodedResults {
    /// One decoded text per input prompt.
    pub texts: Vec<String>,
    pub perf_metrics: PerfMetrics,
}

/// What the engine knows about the device a pipeline runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReport {
    /// Device as requested on the command line.
    pub requested: String,
    /// Backend actually selected: `cpu`, `cuda` or `metal`.
    pub kind: &'static str,
    pub ordinal: Option<usize>,
    pub cuda_available: bool,
    pub metal_available: bool,
    /// CPU worker threads used by the engine's kernels.
    pub cpu_threads: usize,
    /// SIMD extensions the CPU kernels were built with.
    pub cpu_features: Vec<&'static str>,
    pub architecture: String,
    /// Longest prompt + generation the loaded model accepts, in tokens.
    pub context_length: usize,
    pub weights_bytes: u64,
    /// `None` when the engine does not expose device memory.
    pub device_memory_bytes: Option<u64>,
}

/// A loaded model that can generate text for a batch of prompts.
///
/// Prompts are processed in order on the calling thread; the streamer is
/// called synchronously from inside `generate`.
pub trait Pipeline {
    fn generate(
        &mut self,
        prompts: &[&str],
        config: &GenerationConfig,
        streamer: Streamer<'_>,
    ) -> Result<DecodedResults>;

    fn device_report(&self) -> Option<DeviceReport> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!("GPU".parse::<Device>().unwrap(), Device::Gpu);
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert_eq!(" Metal ".parse::<Device>().unwrap(), Device::Metal);
    }

    #[test]
    fn test_parse_unknown_device() {
        let err = "NPU".parse::<Device>().unwrap_err();
        assert!(matches!(err, BenchError::UnknownDevice { ref name } if name == "NPU"));
        assert!("CUDA:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_display_round_trips() {
        for device in [Device::Cpu, Device::Gpu, Device::Cuda(1), Device::Metal] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn test_default_device_follows_build() {
        if cfg!(any(feature = "cuda", feature = "metal")) {
            assert_eq!(DEFAULT_DEVICE, Device::Gpu);
        } else {
            assert_eq!(DEFAULT_DEVICE, Device::Cpu);
        }
    }

    #[test]
    fn test_default_generation_config() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 128);
    }
}
