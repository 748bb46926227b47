/// Synthetic long-context prompts used for every run so each length tier
/// feeds exactly the same bytes to the pipeline.
///
/// Prompt size rules:
///  • A long prompt is header ++ (BASE_CHUNK × repeats) ++ footer.
///  • Token count grows linearly with `repeats`; the exact count is only
///    known once the tokenizer has seen the text (printed as
///    `Input tokens:` after each run).
///  • The baseline prompt is fixed and short (~200 tokens).

/// A single benchmark scenario: a label and the prompt text fed to the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkPrompt {
    /// Label shown in banners and result tables.
    pub name: String,
    /// The actual prompt text.
    pub text: String,
}

impl BenchmarkPrompt {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// One entry of the length table: label and how many times the paragraph
/// is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthTier {
    pub label: &'static str,
    pub repeats: usize,
}

/// Approximate repeats for each length tier. Tune these after looking at
/// `Input tokens:` in the metrics.
pub const REPEATS_FOR_LEN: &[LengthTier] = &[
    LengthTier { label: "len_1k", repeats: 8 },  // ~1K tokens
    LengthTier { label: "len_2k", repeats: 16 }, // ~2K
    LengthTier { label: "len_4k", repeats: 32 }, // ~4K
    LengthTier { label: "len_8k", repeats: 64 }, // ~8K (big!)
];

/// Label of the baseline prompt; always first in the suite.
pub const BASE_PROMPT_LABEL: &str = "base_200";

/// Technical paragraph repeated to grow the context.
pub const BASE_CHUNK: &str = "Modern AI runtime systems must coordinate CPU, GPU, and NPU execution while \
respecting power, thermal, and memory constraints. The runtime tracks key \
metrics such as TTFT (time to first token), TPOT (time per output token), \
and overall token throughput. To reach high efficiency, the system must map \
prefill and decode phases onto the right device, maintain KV-cache locality \
across tokens, and minimize page faults when using unified shared memory. \
In practice, this means balancing arithmetic intensity, memory bandwidth, \
and latency, while also reacting to changes in workload, user interaction \
patterns, and operating system power policies.\n\n";

const HEADER_PREAMBLE: &str = "You are a technical writer specializing in AI runtime systems. \
Read the following long context carefully. \
After the context, you will be asked to write a concise answer.\n\n\
IMPORTANT:\n\
- Do NOT describe your reasoning or planning.\n\
- Do NOT include words like 'analysis' or meta commentary.\n\
- Reply only with the final answer content.\n\n";

const FOOTER: &str = "### Task ###\n\
Using the above context, write a concise technical summary (one or two \
paragraphs) about how AI runtimes manage device scheduling, KV-cache \
memory, and latency metrics such as TTFT and TPOT. Reply directly with \
the summary only.\n";

const BASE_PROMPT: &str = "Explain how OpenVINO optimizes AI inference on edge devices. \
Specifically discuss how it handles scheduling across CPU, GPU, and NPU \
on modern hybrid architectures such as Intel Lunar Lake or Panther Lake systems. \
Describe how memory-bound workloads benefit from model compression, operator \
fusion, and KV-cache locality. Focus on mechanisms like static vs dynamic \
shapes, unified shared memory, GPU page faults, and latency-critical \
execution paths. Provide a structured explanation. \
Do NOT include any meta commentary or analysis; answer directly.";

fn header(label: &str) -> String {
    format!("{HEADER_PREAMBLE}### Context for scenario {label} ###\n\n")
}

/// Build a prompt with a long context plus a final instruction.
///
/// More repeats means more tokens; zero repeats yields header and footer
/// only.
pub fn build_long_prompt(label: &str, repeats: usize) -> String {
    let header = header(label);
    let mut prompt = String::with_capacity(header.len() + BASE_CHUNK.len() * repeats + FOOTER.len());
    prompt.push_str(&header);
    prompt.push_str(&BASE_CHUNK.repeat(repeats));
    prompt.push_str(FOOTER);
    prompt
}

/// The short fixed baseline prompt.
pub fn base_prompt() -> &'static str {
    BASE_PROMPT
}

/// Baseline prompt first, then one long prompt per tier in table order.
pub fn build_prompt_suite(tiers: &[LengthTier]) -> Vec<BenchmarkPrompt> {
    let mut prompts = Vec::with_capacity(tiers.len() + 1);
    prompts.push(BenchmarkPrompt::new(BASE_PROMPT_LABEL, base_prompt()));
    for tier in tiers {
        prompts.push(BenchmarkPrompt::new(
            tier.label,
            build_long_prompt(tier.label, tier.repeats),
        ));
    }
    prompts
}
