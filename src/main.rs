mod benchmark;
#[cfg(feature = "candle")]
mod candle_runner;
mod error;
mod metrics;
mod pipeline;
mod prompts;
mod streamer;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use benchmark::{
    compare_results, ensure_cache_dir, print_system_info, run_suite, BenchmarkConfig, DEFAULT_MODEL_DIR,
};
use pipeline::{Device, Pipeline, PipelineConfig, DEFAULT_DEVICE};
use prompts::{build_prompt_suite, REPEATS_FOR_LEN};
use streamer::console_streamer;

/// Hub models that can stand in for an empty model directory
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// Qwen2.5-1.5B-Instruct, Q4_K_M (32K context)
    #[value(name = "qwen2.5-1.5b")]
    Qwen15b,
    /// Qwen2.5-0.5B-Instruct, Q4_K_M (32K context)
    #[value(name = "qwen2.5-0.5b")]
    Qwen05b,
}

/// Long-context LLM benchmark: streams output and reports TTFT/TPOT per prompt length
#[derive(Parser, Debug)]
#[command(name = "long-context-bench", version)]
struct Cli {
    /// Directory holding the GGUF weights and tokenizer.json
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,

    /// Execution device: CPU, GPU, CUDA, CUDA:<n> or METAL [default: GPU with
    /// the `cuda`/`metal` feature, CPU otherwise]
    #[arg(long, default_value_t = DEFAULT_DEVICE)]
    device: Device,

    /// Engine cache directory [default: <model-dir>/engine_cache]
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Memory-map the weights file instead of reading it
    #[arg(long)]
    enable_mmap: bool,

    /// Tokens generated per prompt
    #[arg(long, default_value_t = 128)]
    max_new_tokens: usize,

    /// Sampling seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Download this model into the cache when the model directory is empty
    #[arg(long, value_enum)]
    preset: Option<Preset>,
}

impl Cli {
    fn into_config(self) -> BenchmarkConfig {
        let mut config = BenchmarkConfig::new(self.model_dir);
        if let Some(cache_dir) = self.cache_dir {
            config.cache_dir = cache_dir;
        }
        config.device = self.device;
        config.enable_mmap = self.enable_mmap;
        config.generation.max_new_tokens = self.max_new_tokens;
        config.generation.seed = self.seed;
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let preset = cli.preset;
    let config = cli.into_config();

    ensure_cache_dir(&config.cache_dir)?;

    println!("going to run inference pipeline...");

    let mut pipe = open_pipeline(&config, preset)?;

    let prompts = build_prompt_suite(REPEATS_FOR_LEN);
    let mut stdout = io::stdout();
    let results = run_suite(
        &mut *pipe,
        &prompts,
        &config.generation,
        &mut console_streamer,
        &mut stdout,
    )?;

    compare_results(&mut stdout, &results)?;

    let report = pipe.device_report();
    drop(pipe);
    tracing::info!("pipeline released");

    print_system_info(&mut stdout, report.as_ref())?;
    Ok(())
}

#[cfg(feature = "candle")]
fn open_pipeline(config: &BenchmarkConfig, preset: Option<Preset>) -> Result<Box<dyn Pipeline>> {
    use candle_runner::{CandlePipeline, ModelPreset};

    let preset = preset.map(|p| match p {
        Preset::Qwen15b => ModelPreset::qwen2_5_1_5b(),
        Preset::Qwen05b => ModelPreset::qwen2_5_0_5b(),
    });
    if let Some(preset) = &preset {
        tracing::info!(model = preset.display_name, "hub fallback enabled");
    }

    let pipeline_config = PipelineConfig {
        cache_dir: config.cache_dir.clone(),
        enable_mmap: config.enable_mmap,
    };
    let pipe = CandlePipeline::load(&config.model_dir, config.device, &pipeline_config, preset.as_ref())?;
    Ok(Box::new(pipe))
}

#[cfg(not(feature = "candle"))]
fn open_pipeline(_config: &BenchmarkConfig, _preset: Option<Preset>) -> Result<Box<dyn Pipeline>> {
    anyhow::bail!("built without an inference engine; enable the `candle` feature")
}
