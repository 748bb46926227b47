use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::metrics::PerfMetrics;
use crate::pipeline::{Device, DeviceReport, GenerationConfig, Pipeline, Streamer, DEFAULT_DEVICE};
use crate::prompts::BenchmarkPrompt;

/// Per-prompt figures kept for the closing comparison table
#[derive(Debug, Clone, PartialEq)]
pub struct PromptStats {
    pub name: String,
    pub input_tokens: usize,
    pub generated_tokens: usize,
    pub ttft_ms: f64,
    pub tpot_ms: f64,
    pub tokens_per_second: f64,
}

impl PromptStats {
    pub fn from_metrics(name: &str, metrics: &PerfMetrics) -> Self {
        Self {
            name: name.to_string(),
            input_tokens: metrics.get_num_input_tokens(),
            generated_tokens: metrics.get_num_generated_tokens(),
            ttft_ms: metrics.get_ttft().mean,
            tpot_ms: metrics.get_tpot().mean,
            tokens_per_second: metrics.get_throughput().mean,
        }
    }
}

/// Create the cache directory and its parents; succeeds if it already exists
pub fn ensure_cache_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    tracing::info!(path = %path.display(), "cache directory ready");
    Ok(())
}

/// Print the fixed block of metric lines for one run
pub fn print_metrics<W: Write>(out: &mut W, metrics: &PerfMetrics) -> Result<()> {
    writeln!(out, "=== Perf metrics ===")?;
    writeln!(out, "TTFT (ms):             {:.3}", metrics.get_ttft().mean)?;
    writeln!(out, "TPOT (ms/token):       {:.3}", metrics.get_tpot().mean)?;
    writeln!(out, "Throughput (tok/s):    {:.3}", metrics.get_throughput().mean)?;
    writeln!(out, "Input tokens:          {}", metrics.get_num_input_tokens())?;
    writeln!(out, "Generated tokens:      {}", metrics.get_num_generated_tokens())?;
    writeln!(out, "Generate time (ms):    {:.3}", metrics.get_generate_duration().mean)?;
    writeln!(out, "Inference time (ms):   {:.3}", metrics.get_inference_duration().mean)?;
    writeln!(out, "\n")?;
    Ok(())
}

/// Run one prompt: banner, streamed output, metrics
pub fn run_prompt<P, W>(
    pipe: &mut P,
    prompt: &BenchmarkPrompt,
    config: &GenerationConfig,
    streamer: Streamer<'_>,
    out: &mut W,
) -> Result<PromptStats>
where
    P: Pipeline + ?Sized,
    W: Write,
{
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "PROMPT: {}", prompt.name)?;
    writeln!(out, "{}", "-".repeat(80))?;
    writeln!(out, "Streaming output:\n")?;
    out.flush()?;

    let result = pipe.generate(&[prompt.text.as_str()], config, streamer)?;

    writeln!(out, "\n\n[END OF STREAM]\n")?;

    let metrics = &result.perf_metrics;
    tracing::debug!(
        prompt = %prompt.name,
        input_tokens = metrics.get_num_input_tokens(),
        generated_tokens = metrics.get_num_generated_tokens(),
        output_bytes = result.texts.iter().map(String::len).sum::<usize>(),
        tokenization_ms = metrics.get_tokenization_duration().mean,
        detokenization_ms = metrics.get_detokenization_duration().mean,
        load_time_ms = metrics.get_load_time(),
        "generation finished"
    );
    print_metrics(out, metrics)?;
    out.flush()?;

    Ok(PromptStats::from_metrics(&prompt.name, metrics))
}

/// Run every prompt in order, one at a time
pub fn run_suite<P, W>(
    pipe: &mut P,
    prompts: &[BenchmarkPrompt],
    config: &GenerationConfig,
    streamer: Streamer<'_>,
    out: &mut W,
) -> Result<Vec<PromptStats>>
where
    P: Pipeline + ?Sized,
    W: Write,
{
    let mut results = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        results.push(run_prompt(pipe, prompt, config, &mut *streamer, out)?);
    }
    Ok(results)
}

/// Compare latency figures across prompt lengths
pub fn compare_results<W: Write>(out: &mut W, results: &[PromptStats]) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }

    writeln!(out, "╔═══════════════════════════════════════════════════════════════════════════════╗")?;
    writeln!(out, "║                        LONG-CONTEXT COMPARISON                                ║")?;
    writeln!(out, "╠═══════════════════════════════════════════════════════════════════════════════╣")?;
    writeln!(
        out,
        "║ {:10} │ {:>10} │ {:>10} │ {:>12} │ {:>12} │ {:>10} ║",
        "Prompt", "In tok", "Out tok", "TTFT (ms)", "TPOT (ms)", "tok/s"
    )?;
    writeln!(out, "╟────────────┼────────────┼────────────┼──────────────┼──────────────┼────────────╢")?;

    for result in results {
        writeln!(
            out,
            "║ {:10} │ {:>10} │ {:>10} │ {:>12.3} │ {:>12.3} │ {:>10.2} ║",
            result.name,
            result.input_tokens,
            result.generated_tokens,
            result.ttft_ms,
            result.tpot_ms,
            result.tokens_per_second
        )?;
    }

    writeln!(out, "╚═══════════════════════════════════════════════════════════════════════════════╝")?;

    if let Some(fastest) = results
        .iter()
        .min_by(|a, b| a.ttft_ms.total_cmp(&b.ttft_ms))
    {
        writeln!(
            out,
            "\nLowest TTFT: {} ({:.3} ms for {} input tokens)\n",
            fastest.name, fastest.ttft_ms, fastest.input_tokens
        )?;
    }
    Ok(())
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

/// Host information plus, when the engine provides one, the device report
pub fn print_system_info<W: Write>(out: &mut W, report: Option<&DeviceReport>) -> Result<()> {
    writeln!(out, "System Information:")?;
    writeln!(out, "  • OS: {}", std::env::consts::OS)?;
    writeln!(out, "  • Architecture: {}", std::env::consts::ARCH)?;

    let Some(report) = report else {
        writeln!(out, "  • Device: no report from engine\n")?;
        return Ok(());
    };

    writeln!(out, "\n=== Device ===")?;
    writeln!(out, "Requested:             {}", report.requested)?;
    match report.ordinal {
        Some(ordinal) => writeln!(out, "Selected:              {}:{}", report.kind, ordinal)?,
        None => writeln!(out, "Selected:              {}", report.kind)?,
    }
    writeln!(out, "CUDA available:        {}", yes_no(report.cuda_available))?;
    writeln!(out, "Metal available:       {}", yes_no(report.metal_available))?;
    writeln!(out, "CPU threads:           {}", report.cpu_threads)?;
    let features = if report.cpu_features.is_empty() {
        "none".to_string()
    } else {
        report.cpu_features.join(", ")
    };
    writeln!(out, "CPU SIMD:              {features}")?;

    writeln!(out, "\n=== Model vs memory ===")?;
    writeln!(out, "Model architecture:    {}", report.architecture)?;
    writeln!(out, "Context length:        {} tokens", report.context_length)?;
    writeln!(out, "Weights size:          {:.2} GB", gib(report.weights_bytes))?;
    match report.device_memory_bytes {
        Some(mem) => {
            writeln!(out, "Device memory:         {:.2} GB", gib(mem))?;
            let share = report.weights_bytes as f64 / mem as f64 * 100.0;
            writeln!(out, "Weights / memory:      {share:.1}%")?;
            if report.weights_bytes > mem {
                writeln!(out, "[WARN] weights exceed device memory")?;
            }
        }
        None => writeln!(out, "Device memory:         not exposed by engine")?,
    }
    writeln!(out)?;
    Ok(())
}

/// Fixed parameters of a benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    pub model_dir: PathBuf,
    pub device: Device,
    pub cache_dir: PathBuf,
    pub enable_mmap: bool,
    pub generation: GenerationConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_MODEL_DIR))
    }
}

/// Model directory used when none is given
pub const DEFAULT_MODEL_DIR: &str = "./model/qwen2.5-1.5b-instruct";

/// Cache subdirectory created beneath the model directory
pub const CACHE_SUBDIR: &str = "engine_cache";

impl BenchmarkConfig {
    pub fn new(model_dir: PathBuf) -> Self {
        let cache_dir = model_dir.join(CACHE_SUBDIR);
        Self {
            model_dir,
            device: DEFAULT_DEVICE,
            cache_dir,
            enable_mmap: false,
            generation: GenerationConfig::default(),
        }
    }
}
