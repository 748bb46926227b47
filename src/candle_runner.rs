//! Inference pipeline backed by HuggingFace Candle.
//!
//! Loads a GGUF-quantised model plus its `tokenizer.json` from the model
//! directory (or, with a preset, from the HuggingFace Hub into the cache
//! directory) and runs greedy generation, streaming decoded text and
//! recording the timings that feed [`PerfMetrics`].
//!
//! The loader is picked from the GGUF `general.architecture` key
//! (`llama`, `qwen2` or `phi3`), and the model's context length comes from
//! `<arch>.context_length`. A prompt that cannot fit together with the
//! requested generation is rejected before prefill.
//!
//! # Measurement notes
//! • Temperature is always 0 (greedy), so runs are repeatable.
//! • Model load time is measured separately and excluded from every
//!   per-prompt figure.
//! • TTFT includes tokenisation and the whole prefill pass.
//! • TPOT is the gap between successive generated tokens, streaming
//!   included.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::quantized::gguf_file;
use candle_core::{IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{quantized_llama, quantized_phi3, quantized_qwen2};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use tokenizers::Tokenizer;

use crate::error::{BenchError, Result};
use crate::metrics::{PerfMetrics, RawPerfMetrics};
use crate::pipeline::{
    DecodedResults, Device, DeviceReport, GenerationConfig, Pipeline, PipelineConfig, StreamingStatus,
    Streamer,
};

// ──────────────────────────────────────────────────────────────────────────
// Model location
// ──────────────────────────────────────────────────────────────────────────

/// Hub coordinates used when the model directory is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPreset {
    /// HuggingFace repo id for the GGUF weights.
    pub hf_repo: &'static str,
    /// Filename of the GGUF file inside that repo.
    pub gguf_file: &'static str,
    /// HuggingFace repo id for the tokeniser (usually the original model).
    pub tokenizer_repo: &'static str,
    /// Human-readable name for logs.
    pub display_name: &'static str,
}

impl ModelPreset {
    /// Default long-context model: 32K tokens, so every length tier fits.
    pub fn qwen2_5_1_5b() -> Self {
        Self {
            hf_repo: "Qwen/Qwen2.5-1.5B-Instruct-GGUF",
            gguf_file: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2.5-1.5B-Instruct",
            display_name: "Qwen2.5-1.5B-Instruct Q4_K_M",
        }
    }

    /// Same 32K context at a third of the size, for CPU smoke runs.
    pub fn qwen2_5_0_5b() -> Self {
        Self {
            hf_repo: "Qwen/Qwen2.5-0.5B-Instruct-GGUF",
            gguf_file: "qwen2.5-0.5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2.5-0.5B-Instruct",
            display_name: "Qwen2.5-0.5B-Instruct Q4_K_M",
        }
    }
}

/// Paths of the two files a pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Find `*.gguf` (first by name) and `tokenizer.json` in `model_dir`.
pub fn resolve_local(model_dir: &Path) -> Result<ModelFiles> {
    if !model_dir.is_dir() {
        return Err(BenchError::model_not_found(model_dir, "model directory"));
    }

    let mut ggufs: Vec<PathBuf> = fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "gguf"))
        .collect();
    ggufs.sort();
    let weights = ggufs
        .into_iter()
        .next()
        .ok_or_else(|| BenchError::model_not_found(model_dir, "GGUF weights"))?;

    let tokenizer = model_dir.join(TOKENIZER_FILE);
    if !tokenizer.is_file() {
        return Err(BenchError::model_not_found(model_dir, TOKENIZER_FILE));
    }

    Ok(ModelFiles { weights, tokenizer })
}

/// Download (or reuse cached) weights and tokeniser into `cache_dir`.
pub fn fetch_from_hub(preset: &ModelPreset, cache_dir: &Path) -> Result<ModelFiles> {
    let download = |e: hf_hub::api::sync::ApiError| BenchError::Download {
        reason: e.to_string(),
    };

    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .build()
        .map_err(download)?;

    tracing::info!(repo = preset.hf_repo, file = preset.gguf_file, "fetching weights");
    let weights = api
        .repo(Repo::new(preset.hf_repo.to_string(), RepoType::Model))
        .get(preset.gguf_file)
        .map_err(download)?;

    tracing::info!(repo = preset.tokenizer_repo, "fetching tokeniser");
    let tokenizer = api
        .repo(Repo::new(preset.tokenizer_repo.to_string(), RepoType::Model))
        .get(TOKENIZER_FILE)
        .map_err(download)?;

    Ok(ModelFiles { weights, tokenizer })
}

/// Local files win; the hub is only consulted when they are missing and a
/// preset was given.
pub fn resolve_model_files(
    model_dir: &Path,
    cache_dir: &Path,
    preset: Option<&ModelPreset>,
) -> Result<ModelFiles> {
    match (resolve_local(model_dir), preset) {
        (Ok(files), _) => Ok(files),
        (Err(BenchError::ModelNotFound { .. }), Some(preset)) => fetch_from_hub(preset, cache_dir),
        (Err(e), _) => Err(e),
    }
}

// ──────────────────────────────────────────────────────────────────────────
// Loading
// ──────────────────────────────────────────────────────────────────────────

fn gpu_missing_reason() -> &'static str {
    if cfg!(any(feature = "cuda", feature = "metal")) {
        "no CUDA or Metal device found"
    } else {
        "built without the `cuda` or `metal` feature; rebuild with one of them or pass --device CPU"
    }
}

fn select_device(device: Device) -> Result<candle_core::Device> {
    use candle_core::utils::{cuda_is_available, metal_is_available};

    let unavailable = |reason: String| {
        tracing::warn!(%device, %reason, "device initialisation failed");
        BenchError::DeviceUnavailable {
            device: device.to_string(),
            reason,
        }
    };

    match device {
        Device::Cpu => Ok(candle_core::Device::Cpu),
        Device::Cuda(ordinal) => {
            candle_core::Device::new_cuda(ordinal).map_err(|e| unavailable(e.to_string()))
        }
        Device::Metal => candle_core::Device::new_metal(0).map_err(|e| unavailable(e.to_string())),
        Device::Gpu if cuda_is_available() => {
            candle_core::Device::new_cuda(0).map_err(|e| unavailable(e.to_string()))
        }
        Device::Gpu if metal_is_available() => {
            candle_core::Device::new_metal(0).map_err(|e| unavailable(e.to_string()))
        }
        Device::Gpu => Err(unavailable(gpu_missing_reason().to_string())),
    }
}

fn at(stage: &'static str) -> impl Fn(candle_core::Error) -> BenchError {
    move |e| BenchError::engine(stage, e)
}

/// Model families the GGUF loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Architecture {
    Llama,
    Qwen2,
    Phi3,
}

impl Architecture {
    fn from_metadata(metadata: &HashMap<String, gguf_file::Value>) -> Result<Self> {
        let name = metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .ok_or_else(|| BenchError::engine("load", "GGUF has no general.architecture"))?;
        match name.as_str() {
            "llama" => Ok(Self::Llama),
            "qwen2" => Ok(Self::Qwen2),
            "phi3" => Ok(Self::Phi3),
            other => Err(BenchError::engine(
                "load",
                format!("unsupported architecture '{other}' (expected llama, qwen2 or phi3)"),
            )),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Qwen2 => "qwen2",
            Self::Phi3 => "phi3",
        }
    }

    /// Tokens the loaded model can attend over.
    ///
    /// The llama loader builds a fixed rotary table, so its limit is the
    /// smaller of the declared context and that table.
    fn context_length(self, metadata: &HashMap<String, gguf_file::Value>) -> Result<usize> {
        let key = format!("{}.context_length", self.name());
        let declared = metadata
            .get(&key)
            .and_then(|v| v.to_u64().or_else(|_| v.to_u32().map(u64::from)).ok())
            .map(|n| n as usize);

        match (self, declared) {
            (Self::Llama, Some(n)) => Ok(n.min(quantized_llama::MAX_SEQ_LEN)),
            (Self::Llama, None) => Ok(quantized_llama::MAX_SEQ_LEN),
            (_, Some(n)) => Ok(n),
            (_, None) => Err(BenchError::engine("load", format!("GGUF has no {key}"))),
        }
    }
}

enum Weights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
    Phi3(quantized_phi3::ModelWeights),
}

impl Weights {
    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(m) => m.forward(input, pos),
            Self::Qwen2(m) => m.forward(input, pos),
            Self::Phi3(m) => m.forward(input, pos),
        }
    }
}

struct LoadedWeights {
    weights: Weights,
    architecture: Architecture,
    context_length: usize,
}

fn load_gguf<R: Read + Seek>(reader: &mut R, device: &candle_core::Device) -> Result<LoadedWeights> {
    let content = gguf_file::Content::read(reader).map_err(at("load"))?;
    let architecture = Architecture::from_metadata(&content.metadata)?;
    let context_length = architecture.context_length(&content.metadata)?;
    tracing::debug!(architecture = architecture.name(), context_length, "GGUF header read");

    let weights = match architecture {
        Architecture::Llama => {
            quantized_llama::ModelWeights::from_gguf(content, reader, device).map(Weights::Llama)
        }
        Architecture::Qwen2 => {
            quantized_qwen2::ModelWeights::from_gguf(content, reader, device).map(Weights::Qwen2)
        }
        Architecture::Phi3 => {
            quantized_phi3::ModelWeights::from_gguf(false, content, reader, device).map(Weights::Phi3)
        }
    }
    .map_err(at("load"))?;

    Ok(LoadedWeights {
        weights,
        architecture,
        context_length,
    })
}

fn read_weights(path: &Path, device: &candle_core::Device, enable_mmap: bool) -> Result<LoadedWeights> {
    let file = File::open(path)?;
    if enable_mmap {
        // SAFETY: the weights file is opened read-only and is not modified
        // while the map is alive; the map is dropped once tensors are copied.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        load_gguf(&mut Cursor::new(&mmap[..]), device)
    } else {
        load_gguf(&mut BufReader::new(file), device)
    }
}

/// Every end-of-sequence marker the tokeniser knows; chat models often
/// carry more than one.
fn find_eos(tokenizer: &Tokenizer) -> Vec<u32> {
    let ids: Vec<u32> = ["</s>", "<|end_of_text|>", "<|endoftext|>", "<|end|>", "<|im_end|>", "<|eot_id|>"]
        .iter()
        .filter_map(|t| tokenizer.token_to_id(t))
        .collect();
    if ids.is_empty() {
        vec![2]
    } else {
        ids
    }
}

/// Reject a request whose prompt plus generation would run past the
/// model's positional range.
fn check_context(prompt_tokens: usize, max_new_tokens: usize, context_length: usize) -> Result<()> {
    if prompt_tokens + max_new_tokens > context_length {
        return Err(BenchError::engine(
            "prefill",
            format!(
                "prompt of {prompt_tokens} tokens plus {max_new_tokens} new tokens exceeds the model context of {context_length}"
            ),
        ));
    }
    Ok(())
}

/// Greedy pick from the logits of the final position. Loaders return
/// either `[batch, vocab]` or `[batch, seq, vocab]`.
fn sample_last(logits: &Tensor, processor: &mut LogitsProcessor) -> Result<u32> {
    let last = match logits.rank() {
        3 => {
            let seq = logits.dim(1).map_err(at("sample"))?;
            logits.i((0usize, seq - 1))
        }
        2 => logits.i(0usize),
        _ => Ok(logits.clone()),
    }
    .map_err(at("sample"))?;
    processor.sample(&last).map_err(at("sample"))
}

// ──────────────────────────────────────────────────────────────────────────
// Streaming text
// ──────────────────────────────────────────────────────────────────────────

/// Turns "full decode so far" into the fragment not yet emitted.
#[derive(Debug, Default)]
struct IncrementalText {
    emitted: String,
}

impl IncrementalText {
    fn next_fragment(&mut self, decoded: &str) -> Option<String> {
        // Incomplete multi-byte sequence; wait for the next token.
        if decoded.ends_with('\u{FFFD}') {
            return None;
        }
        self.emit(decoded)
    }

    /// Flush whatever is left once decoding is over, replacement
    /// characters included.
    fn finish(&mut self, decoded: &str) -> Option<String> {
        self.emit(decoded)
    }

    fn emit(&mut self, decoded: &str) -> Option<String> {
        let start = if decoded.starts_with(self.emitted.as_str()) {
            self.emitted.len()
        } else {
            // The tokeniser rewrote earlier text; resume from the closest
            // char boundary instead of dropping the tail.
            let mut cut = self.emitted.len().min(decoded.len());
            while !decoded.is_char_boundary(cut) {
                cut -= 1;
            }
            cut
        };
        let fragment = &decoded[start..];
        if fragment.is_empty() {
            return None;
        }
        let fragment = fragment.to_string();
        self.emitted = decoded.to_string();
        Some(fragment)
    }
}

/// What the decode loop produced for one prompt.
#[derive(Debug)]
struct DecodeOutcome {
    tokens: Vec<u32>,
    /// Final text; empty when the streamer cancelled.
    text: String,
    status: StreamingStatus,
    /// Gaps between consecutive generated tokens (the first token is TTFT).
    token_intervals: Vec<Duration>,
    inference: Duration,
    detokenization: Duration,
}

/// Generate from `first` until an EOS token, the token limit, or a
/// non-`Running` streamer status.
///
/// `step(token, pos)` feeds one token at position `pos` and returns the
/// next sampled token. Everything streamed concatenates to the returned
/// text unless the run was cancelled.
fn decode_loop<S, D>(
    first: u32,
    prompt_len: usize,
    max_new_tokens: usize,
    eos: &[u32],
    mut step: S,
    mut detokenize: D,
    streamer: Streamer<'_>,
) -> Result<DecodeOutcome>
where
    S: FnMut(u32, usize) -> Result<u32>,
    D: FnMut(&[u32]) -> Result<String>,
{
    let mut out = DecodeOutcome {
        tokens: Vec::with_capacity(max_new_tokens),
        text: String::new(),
        status: StreamingStatus::Running,
        token_intervals: Vec::new(),
        inference: Duration::ZERO,
        detokenization: Duration::ZERO,
    };
    let mut stream = IncrementalText::default();
    let mut next = first;
    let mut last_token_at = Instant::now();

    while !eos.contains(&next) && out.tokens.len() < max_new_tokens {
        out.tokens.push(next);

        let t = Instant::now();
        let decoded = detokenize(&out.tokens)?;
        out.detokenization += t.elapsed();
        if let Some(fragment) = stream.next_fragment(&decoded) {
            out.status = streamer(fragment.as_str());
            if out.status != StreamingStatus::Running {
                break;
            }
        }
        if out.tokens.len() >= max_new_tokens {
            break;
        }

        let t = Instant::now();
        next = step(next, prompt_len + out.tokens.len() - 1)?;
        out.inference += t.elapsed();
        if !eos.contains(&next) {
            out.token_intervals.push(last_token_at.elapsed());
        }
        last_token_at = Instant::now();
    }

    let t = Instant::now();
    out.text = detokenize(&out.tokens)?;
    out.detokenization += t.elapsed();

    if out.status == StreamingStatus::Running {
        if let Some(rest) = stream.finish(&out.text) {
            out.status = streamer(rest.as_str());
        }
    }
    if out.status == StreamingStatus::Cancel {
        out.text.clear();
    }
    Ok(out)
}

// ──────────────────────────────────────────────────────────────────────────
// Pipeline
// ──────────────────────────────────────────────────────────────────────────

pub struct CandlePipeline {
    weights: Weights,
    tokenizer: Tokenizer,
    device: candle_core::Device,
    requested: Device,
    architecture: Architecture,
    context_length: usize,
    weights_bytes: u64,
    eos_token_ids: Vec<u32>,
    load_time: Duration,
}

/// Outcome of a single prompt.
struct RequestOutput {
    text: String,
    raw: RawPerfMetrics,
    status: StreamingStatus,
}

fn forward(
    weights: &mut Weights,
    device: &candle_core::Device,
    tokens: &[u32],
    pos: usize,
    stage: &'static str,
) -> Result<Tensor> {
    let input = Tensor::new(tokens, device)
        .and_then(|t| t.unsqueeze(0))
        .map_err(at(stage))?;
    weights.forward(&input, pos).map_err(at(stage))
}

impl CandlePipeline {
    /// Resolve model files, select the device and load weights + tokeniser.
    pub fn load(
        model_dir: &Path,
        device: Device,
        config: &PipelineConfig,
        preset: Option<&ModelPreset>,
    ) -> Result<Self> {
        let files = resolve_model_files(model_dir, &config.cache_dir, preset)?;
        let candle_device = select_device(device)?;
        let weights_bytes = fs::metadata(&files.weights)?.len();

        tracing::info!(
            weights = %files.weights.display(),
            weights_bytes,
            %device,
            mmap = config.enable_mmap,
            "loading model"
        );
        let t0 = Instant::now();
        let loaded = read_weights(&files.weights, &candle_device, config.enable_mmap)?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(BenchError::tokenizer)?;
        let load_time = t0.elapsed();
        tracing::info!(
            load_time_ms = load_time.as_millis() as u64,
            architecture = loaded.architecture.name(),
            context_length = loaded.context_length,
            "model loaded"
        );

        let eos_token_ids = find_eos(&tokenizer);
        Ok(Self {
            weights: loaded.weights,
            tokenizer,
            device: candle_device,
            requested: device,
            architecture: loaded.architecture,
            context_length: loaded.context_length,
            weights_bytes,
            eos_token_ids,
            load_time,
        })
    }

    fn generate_one(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
        streamer: Streamer<'_>,
    ) -> Result<RequestOutput> {
        let start = Instant::now();

        let encoding = self.tokenizer.encode(prompt, true).map_err(BenchError::tokenizer)?;
        let input_ids: Vec<u32> = encoding.get_ids().to_vec();
        let mut raw = RawPerfMetrics {
            tokenization_durations: vec![start.elapsed()],
            num_input_tokens: input_ids.len(),
            ..Default::default()
        };
        if input_ids.is_empty() {
            return Err(BenchError::engine("prefill", "prompt encoded to zero tokens"));
        }
        check_context(input_ids.len(), config.max_new_tokens, self.context_length)?;

        let mut logits_processor = LogitsProcessor::new(config.seed, Some(0.0), None);

        // ── Prefill ──────────────────────────────────────────────────────
        let t = Instant::now();
        let logits = forward(&mut self.weights, &self.device, &input_ids, 0, "prefill")?;
        let first = sample_last(&logits, &mut logits_processor)?;
        let prefill = t.elapsed();
        raw.ttfts.push(start.elapsed());

        // ── Decode loop ──────────────────────────────────────────────────
        let weights = &mut self.weights;
        let device = &self.device;
        let tokenizer = &self.tokenizer;
        let outcome = decode_loop(
            first,
            input_ids.len(),
            config.max_new_tokens,
            &self.eos_token_ids,
            |token, pos| {
                let logits = forward(weights, device, &[token], pos, "decode")?;
                sample_last(&logits, &mut logits_processor)
            },
            |tokens| tokenizer.decode(tokens, true).map_err(BenchError::tokenizer),
            streamer,
        )?;

        raw.num_generated_tokens = outcome.tokens.len();
        raw.token_intervals = outcome.token_intervals;
        raw.inference_durations.push(prefill + outcome.inference);
        raw.detokenization_durations.push(outcome.detokenization);
        raw.generate_durations.push(start.elapsed());

        Ok(RequestOutput {
            text: outcome.text,
            raw,
            status: outcome.status,
        })
    }
}

impl Pipeline for CandlePipeline {
    /// Prompts run one after another; a `Stop` or `Cancel` from the
    /// streamer ends the whole call.
    fn generate(
        &mut self,
        prompts: &[&str],
        config: &GenerationConfig,
        streamer: Streamer<'_>,
    ) -> Result<DecodedResults> {
        let mut results = DecodedResults {
            texts: Vec::with_capacity(prompts.len()),
            perf_metrics: PerfMetrics::default().with_load_time(self.load_time),
        };

        for prompt in prompts {
            let output = self.generate_one(prompt, config, &mut *streamer)?;
            results.texts.push(output.text);
            results.perf_metrics = results.perf_metrics + PerfMetrics::new(output.raw);
            if output.status != StreamingStatus::Running {
                break;
            }
        }

        Ok(results)
    }

    /// Candle does not expose device memory, so that field stays empty.
    fn device_report(&self) -> Option<DeviceReport> {
        use candle_core::{utils, DeviceLocation};

        #[allow(unreachable_patterns)]
        let (kind, ordinal) = match self.device.location() {
            DeviceLocation::Cpu => ("cpu", None),
            DeviceLocation::Cuda { gpu_id } => ("cuda", Some(gpu_id)),
            DeviceLocation::Metal { gpu_id } => ("metal", Some(gpu_id)),
            _ => ("other", None),
        };
        let cpu_features = [
            (utils::with_avx(), "avx"),
            (utils::with_neon(), "neon"),
            (utils::with_simd128(), "simd128"),
            (utils::with_f16c(), "f16c"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();

        Some(DeviceReport {
            requested: self.requested.to_string(),
            kind,
            ordinal,
            cuda_available: utils::cuda_is_available(),
            metal_available: utils::metal_is_available(),
            cpu_threads: utils::get_num_threads(),
            cpu_features,
            architecture: self.architecture.name().to_string(),
            context_length: self.context_length,
            weights_bytes: self.weights_bytes,
            device_memory_bytes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_local(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, BenchError::ModelNotFound { what: "model directory", .. }));
    }

    #[test]
    fn test_missing_weights() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(TOKENIZER_FILE), b"{}").unwrap();
        let err = resolve_local(tmp.path()).unwrap_err();
        assert!(matches!(err, BenchError::ModelNotFound { what: "GGUF weights", .. }));
    }

    #[test]
    fn test_missing_tokenizer() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("model.gguf"), b"").unwrap();
        let err = resolve_local(tmp.path()).unwrap_err();
        assert!(matches!(err, BenchError::ModelNotFound { what: TOKENIZER_FILE, .. }));
    }

    #[test]
    fn test_resolve_picks_first_gguf() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("b.Q8_0.gguf"), b"").unwrap();
        fs::write(tmp.path().join("a.Q4_K_M.gguf"), b"").unwrap();
        fs::write(tmp.path().join("README.md"), b"").unwrap();
        fs::write(tmp.path().join(TOKENIZER_FILE), b"{}").unwrap();

        let files = resolve_model_files(tmp.path(), &tmp.path().join("cache"), None).unwrap();
        assert_eq!(files.weights, tmp.path().join("a.Q4_K_M.gguf"));
        assert_eq!(files.tokenizer, tmp.path().join(TOKENIZER_FILE));
    }

    #[test]
    fn test_without_preset_missing_files_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_model_files(tmp.path(), &tmp.path().join("cache"), None).unwrap_err();
        assert!(matches!(err, BenchError::ModelNotFound { .. }));
    }

    #[test]
    fn test_cpu_device_always_available() {
        assert!(matches!(select_device(Device::Cpu).unwrap(), candle_core::Device::Cpu));
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn test_gpu_without_backend_names_feature() {
        let err = select_device(Device::Gpu).unwrap_err();
        assert!(matches!(err, BenchError::DeviceUnavailable { ref device, .. } if device == "GPU"));
        let message = err.to_string();
        assert!(message.contains("`cuda` or `metal` feature"), "{message}");
        assert!(message.contains("--device CPU"), "{message}");
    }

    #[test]
    fn test_unloadable_weights_are_engine_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.gguf");
        fs::write(&path, b"not a gguf file").unwrap();
        for mmap in [false, true] {
            let err = match read_weights(&path, &candle_core::Device::Cpu, mmap) {
                Ok(_) => panic!("garbage weights loaded (mmap = {mmap})"),
                Err(e) => e,
            };
            assert!(matches!(err, BenchError::Engine { stage: "load", .. }));
        }
    }

    fn metadata(arch: &str, context: Option<u32>) -> HashMap<String, gguf_file::Value> {
        let mut md = HashMap::new();
        md.insert(
            "general.architecture".to_string(),
            gguf_file::Value::String(arch.to_string()),
        );
        if let Some(n) = context {
            md.insert(format!("{arch}.context_length"), gguf_file::Value::U32(n));
        }
        md
    }

    #[test]
    fn test_architecture_from_metadata() {
        let md = metadata("qwen2", Some(32768));
        let arch = Architecture::from_metadata(&md).unwrap();
        assert_eq!(arch, Architecture::Qwen2);
        assert_eq!(arch.context_length(&md).unwrap(), 32768);

        let md = metadata("phi3", Some(131072));
        assert_eq!(Architecture::from_metadata(&md).unwrap(), Architecture::Phi3);
    }

    #[test]
    fn test_llama_context_capped_by_rotary_table() {
        let md = metadata("llama", Some(8192));
        let arch = Architecture::from_metadata(&md).unwrap();
        assert_eq!(arch.context_length(&md).unwrap(), quantized_llama::MAX_SEQ_LEN);

        let md = metadata("llama", None);
        assert_eq!(Architecture::Llama.context_length(&md).unwrap(), quantized_llama::MAX_SEQ_LEN);
    }

    #[test]
    fn test_unsupported_or_incomplete_metadata() {
        let err = Architecture::from_metadata(&metadata("gemma", None)).unwrap_err();
        assert!(matches!(err, BenchError::Engine { stage: "load", .. }));
        assert!(err.to_string().contains("gemma"));

        assert!(Architecture::from_metadata(&HashMap::new()).is_err());
        assert!(Architecture::Qwen2.context_length(&metadata("qwen2", None)).is_err());
    }

    #[test]
    fn test_context_check() {
        assert!(check_context(8064, 128, 8192).is_ok());
        assert!(check_context(9000, 128, 32768).is_ok());

        // len_8k on a 4K llama table
        let err = check_context(8100, 128, 4096).unwrap_err();
        assert!(matches!(err, BenchError::Engine { stage: "prefill", .. }));
        assert!(err.to_string().contains("exceeds the model context of 4096"));
        assert!(check_context(4000, 128, 4096).is_err());
    }

    #[test]
    fn test_incremental_text_emits_only_new_text() {
        let mut text = IncrementalText::default();
        assert_eq!(text.next_fragment("Modern").as_deref(), Some("Modern"));
        assert_eq!(text.next_fragment("Modern AI").as_deref(), Some(" AI"));
        assert_eq!(text.next_fragment("Modern AI").as_deref(), None);
        assert_eq!(text.next_fragment("Modern AI runtimes").as_deref(), Some(" runtimes"));
    }

    #[test]
    fn test_incremental_text_waits_for_complete_chars() {
        let mut text = IncrementalText::default();
        assert_eq!(text.next_fragment("caf").as_deref(), Some("caf"));
        assert_eq!(text.next_fragment("caf\u{FFFD}"), None);
        assert_eq!(text.next_fragment("café").as_deref(), Some("é"));
    }

    #[test]
    fn test_incremental_text_rewritten_prefix_keeps_tail() {
        let mut text = IncrementalText::default();
        assert_eq!(text.next_fragment("ab").as_deref(), Some("ab"));
        // Earlier text changed and byte 2 sits inside 'é'; resume at the
        // boundary before it rather than dropping the tail.
        assert_eq!(text.next_fragment("aé x").as_deref(), Some("é x"));
    }

    #[test]
    fn test_incremental_text_finish_flushes_replacement_char() {
        let mut text = IncrementalText::default();
        assert_eq!(text.next_fragment("caf").as_deref(), Some("caf"));
        assert_eq!(text.next_fragment("caf\u{FFFD}"), None);
        assert_eq!(text.finish("caf\u{FFFD}").as_deref(), Some("\u{FFFD}"));
        assert_eq!(text.finish("caf\u{FFFD}"), None);
    }

    const EOS: u32 = 0;

    /// Token `n` decodes to `"t{n} "`.
    fn words(tokens: &[u32]) -> Result<String> {
        Ok(tokens.iter().map(|t| format!("t{t} ")).collect())
    }

    /// Steps through `script`, one token per call.
    fn scripted(script: Vec<u32>) -> impl FnMut(u32, usize) -> Result<u32> {
        let mut script = script.into_iter();
        move |_, _| Ok(script.next().unwrap_or(EOS))
    }

    #[test]
    fn test_decode_stops_at_eos_without_extra_interval() {
        let mut streamed = String::new();
        let mut streamer = |s: &str| {
            streamed.push_str(s);
            StreamingStatus::Running
        };
        let out = decode_loop(1, 10, 128, &[EOS], scripted(vec![2, 3, EOS]), words, &mut streamer).unwrap();

        assert_eq!(out.tokens, vec![1, 2, 3]);
        assert_eq!(out.text, "t1 t2 t3 ");
        assert_eq!(out.status, StreamingStatus::Running);
        // The step that sampled EOS produced no token and no interval.
        assert_eq!(out.token_intervals.len(), out.tokens.len() - 1);
        assert_eq!(streamed, out.text);
    }

    #[test]
    fn test_decode_honours_token_limit() {
        let mut positions = Vec::new();
        let step = |_: u32, pos: usize| {
            positions.push(pos);
            Ok(7)
        };
        let mut streamer = |_: &str| StreamingStatus::Running;
        let out = decode_loop(1, 5, 4, &[EOS], step, words, &mut streamer).unwrap();

        assert_eq!(out.tokens.len(), 4);
        assert_eq!(out.token_intervals.len(), 3);
        assert_eq!(positions, vec![5, 6, 7]);
    }

    #[test]
    fn test_decode_first_token_eos() {
        let mut calls = 0;
        let mut streamer = |_: &str| {
            calls += 1;
            StreamingStatus::Running
        };
        let out = decode_loop(EOS, 5, 128, &[EOS], scripted(vec![]), words, &mut streamer).unwrap();
        assert!(out.tokens.is_empty());
        assert!(out.token_intervals.is_empty());
        assert_eq!(out.text, "");
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_decode_flushes_trailing_replacement_char() {
        // The last token leaves an incomplete multi-byte sequence.
        let detokenize = |tokens: &[u32]| -> Result<String> {
            Ok(match tokens.len() {
                1 => "caf".to_string(),
                _ => "caf\u{FFFD}".to_string(),
            })
        };
        let mut streamed = String::new();
        let mut streamer = |s: &str| {
            streamed.push_str(s);
            StreamingStatus::Running
        };
        let out = decode_loop(1, 3, 2, &[EOS], scripted(vec![2]), detokenize, &mut streamer).unwrap();

        assert_eq!(out.text, "caf\u{FFFD}");
        assert_eq!(streamed, out.text);
    }

    #[test]
    fn test_decode_stop_keeps_partial_text() {
        let mut streamer = |_: &str| StreamingStatus::Stop;
        let out = decode_loop(1, 3, 128, &[EOS], scripted(vec![2, 3]), words, &mut streamer).unwrap();
        assert_eq!(out.status, StreamingStatus::Stop);
        assert_eq!(out.tokens, vec![1]);
        assert_eq!(out.text, "t1 ");
    }

    #[test]
    fn test_decode_cancel_discards_text() {
        let mut seen = 0;
        let mut streamer = |_: &str| {
            seen += 1;
            if seen == 2 {
                StreamingStatus::Cancel
            } else {
                StreamingStatus::Running
            }
        };
        let out = decode_loop(1, 3, 128, &[EOS], scripted(vec![2, 3]), words, &mut streamer).unwrap();
        assert_eq!(out.status, StreamingStatus::Cancel);
        assert_eq!(out.tokens, vec![1, 2]);
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_presets() {
        for preset in [ModelPreset::qwen2_5_1_5b(), ModelPreset::qwen2_5_0_5b()] {
            assert!(preset.gguf_file.ends_with(".gguf"));
            assert!(preset.hf_repo.ends_with("-GGUF"));
        }
    }
}
