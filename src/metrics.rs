//! Performance metrics collected by a pipeline during `generate`.
//!
//! The pipeline records raw timing samples ([`RawPerfMetrics`]); the
//! driver only reads the derived statistics through the `get_*`
//! accessors on [`PerfMetrics`].

use std::ops::Add;
use std::time::Duration;

/// Mean and standard deviation of a set of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanStdPair {
    pub mean: f64,
    pub std: f64,
}

impl MeanStdPair {
    /// Population mean/std; zeros for an empty slice.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
        }
    }

    fn from_durations(durations: &[Duration]) -> Self {
        let ms: Vec<f64> = durations.iter().map(duration_ms).collect();
        Self::from_samples(&ms)
    }
}

fn duration_ms(d: &Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Raw samples, one entry per request unless noted.
#[derive(Debug, Clone, Default)]
pub struct RawPerfMetrics {
    /// Wall time of the whole request, tokenization to final decode.
    pub generate_durations: Vec<Duration>,
    /// Time spent in model forward passes and sampling.
    pub inference_durations: Vec<Duration>,
    pub tokenization_durations: Vec<Duration>,
    pub detokenization_durations: Vec<Duration>,
    /// Request start to first generated token.
    pub ttfts: Vec<Duration>,
    /// Interval between successive generated tokens (all requests).
    pub token_intervals: Vec<Duration>,
    pub num_input_tokens: usize,
    pub num_generated_tokens: usize,
}

/// Metrics returned with every [`crate::pipeline::DecodedResults`].
#[derive(Debug, Clone, Default)]
pub struct PerfMetrics {
    pub raw: RawPerfMetrics,
    /// Time spent loading the model, reported once per pipeline.
    pub load_time: Duration,
}

impl PerfMetrics {
    pub fn new(raw: RawPerfMetrics) -> Self {
        Self {
            raw,
            load_time: Duration::ZERO,
        }
    }

    pub fn with_load_time(mut self, load_time: Duration) -> Self {
        self.load_time = load_time;
        self
    }

    /// Time to first token in milliseconds.
    pub fn get_ttft(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.ttfts)
    }

    /// Time per output token in milliseconds.
    pub fn get_tpot(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.token_intervals)
    }

    /// Tokens per second, derived from TPOT (std propagated to first order).
    pub fn get_throughput(&self) -> MeanStdPair {
        let tpot = self.get_tpot();
        if tpot.mean <= 0.0 {
            return MeanStdPair::default();
        }
        MeanStdPair {
            mean: 1000.0 / tpot.mean,
            std: tpot.std * 1000.0 / (tpot.mean * tpot.mean),
        }
    }

    pub fn get_num_input_tokens(&self) -> usize {
        self.raw.num_input_tokens
    }

    pub fn get_num_generated_tokens(&self) -> usize {
        self.raw.num_generated_tokens
    }

    pub fn get_generate_duration(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.generate_durations)
    }

    pub fn get_inference_duration(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.inference_durations)
    }

    pub fn get_tokenization_duration(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.tokenization_durations)
    }

    pub fn get_detokenization_duration(&self) -> MeanStdPair {
        MeanStdPair::from_durations(&self.raw.detokenization_durations)
    }

    /// Model load time in milliseconds.
    pub fn get_load_time(&self) -> f64 {
        duration_ms(&self.load_time)
    }
}

impl Add for PerfMetrics {
    type Output = PerfMetrics;

    fn add(mut self, rhs: PerfMetrics) -> PerfMetrics {
        let raw = &mut self.raw;
        raw.generate_durations.extend(rhs.raw.generate_durations);
        raw.inference_durations.extend(rhs.raw.inference_durations);
        raw.tokenization_durations.extend(rhs.raw.tokenization_durations);
        raw.detokenization_durations.extend(rhs.raw.detokenization_durations);
        raw.ttfts.extend(rhs.raw.ttfts);
        raw.token_intervals.extend(rhs.raw.token_intervals);
        raw.num_input_tokens += rhs.raw.num_input_tokens;
        raw.num_generated_tokens += rhs.raw.num_generated_tokens;
        self.load_time = self.load_time.max(rhs.load_time);
        self
    }
}
