use std::{convert::Infallible, fmt, path::PathBuf, str::FromStr, sync::Arc};

use alpaca_base::{
    Greedy, InferenceParameters, InferenceSessionConfig, PromptTemplate, Sampler, TopPTopK,
};
use alpaca_llama::{Llama, ModelParameters};
use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub enum Args {
    #[command()]
    /// Connect to Discord and answer every message that starts with the trigger.
    Serve(Box<Serve>),

    #[command()]
    /// Use the model to answer one instruction on the console, and exit.
    Infer(Box<Infer>),

    #[command()]
    /// Dumps the rendered prompt's tokens to the console and exits, first as a
    /// comma-separated list of token IDs and then as token text and ID pairs.
    PromptTokens(Box<PromptTokens>),
}

#[derive(Parser, Debug)]
pub struct Serve {
    #[command(flatten)]
    pub model_load: ModelLoad,

    #[command(flatten)]
    pub prompt_file: PromptFile,

    #[command(flatten)]
    pub generate: Generate,

    /// The Discord bot token.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub token: DiscordToken,

    /// Messages that start with this exact, case-sensitive prefix are answered.
    #[arg(long, default_value = alpaca_base::DEFAULT_TRIGGER)]
    pub trigger: String,

    /// How many requests may wait while another one is being answered. Further
    /// requests are turned away with a "busy" reply.
    #[arg(long, default_value_t = 8)]
    pub queue_capacity: usize,
}

#[derive(Parser, Debug)]
pub struct Infer {
    #[command(flatten)]
    pub model_load: ModelLoad,

    #[command(flatten)]
    pub prompt_file: PromptFile,

    #[command(flatten)]
    pub generate: Generate,

    /// The instruction to answer.
    ///
    /// It is substituted for `{{PROMPT}}` in the template (see `--prompt-file`/`-f`).
    #[arg(long, short = 'p')]
    pub prompt: String,

    /// Feed `--prompt` to the model as is, without the template.
    #[arg(long, default_value_t = false)]
    pub raw: bool,

    /// Output statistics about the time taken to perform inference, among other
    /// things.
    #[arg(long, default_value_t = false)]
    pub stats: bool,
}

#[derive(Parser, Debug)]
pub struct PromptTokens {
    #[command(flatten)]
    pub model_load: ModelLoad,

    #[command(flatten)]
    pub prompt_file: PromptFile,

    /// The instruction to substitute into the template.
    #[arg(long, short = 'p')]
    pub prompt: String,

    /// Tokenize `--prompt` as is, without the template.
    #[arg(long, default_value_t = false)]
    pub raw: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Always pick the most likely token.
    Greedy,
    /// Temperature, top-k and top-p sampling with a repetition penalty.
    TopPTopK,
}

#[derive(Parser, Debug)]
pub struct Generate {
    /// Sets the number of threads to use
    #[arg(long, short = 't')]
    pub num_threads: Option<usize>,

    /// Sets how many tokens to predict
    #[arg(long, short = 'n', default_value_t = alpaca_base::DEFAULT_MAXIMUM_TOKEN_COUNT)]
    pub num_predict: usize,

    /// Specifies the seed to use during sampling. The same seed, prompt and
    /// model always give the same answer on the same machine.
    #[arg(long, default_value_t = alpaca_base::DEFAULT_SEED)]
    pub seed: u64,

    /// How to pick each token.
    #[arg(long, value_enum, default_value_t = SamplerKind::Greedy)]
    pub sampler: SamplerKind,

    /// Size of the 'last N' buffer that is used for the `repeat_penalty`
    /// option. In tokens.
    #[arg(long, default_value_t = 64)]
    pub repeat_last_n: usize,

    /// The penalty for repeating tokens. Higher values make the generation less
    /// likely to get into a loop, but may harm results when repetitive outputs
    /// are desired.
    #[arg(long, default_value_t = 1.30)]
    pub repeat_penalty: f32,

    /// Temperature
    #[arg(long, default_value_t = 0.80)]
    pub temperature: f32,

    /// Top-K: The top K words by score are kept during sampling.
    #[arg(long, default_value_t = 40)]
    pub top_k: usize,

    /// Top-p: The cumulative probability after which no more words are kept
    /// for sampling.
    #[arg(long, default_value_t = 0.95)]
    pub top_p: f32,
}
impl Generate {
    pub fn num_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get_physical)
    }

    pub fn inference_session_config(&self, context_size: usize) -> InferenceSessionConfig {
        InferenceSessionConfig {
            context_size,
            n_threads: self.num_threads(),
        }
    }

    pub fn sampler(&self) -> Arc<dyn Sampler> {
        match self.sampler {
            SamplerKind::Greedy => Arc::new(Greedy),
            SamplerKind::TopPTopK => Arc::new(TopPTopK {
                top_k: self.top_k,
                top_p: self.top_p,
                repeat_penalty: self.repeat_penalty,
                temperature: self.temperature,
                repetition_penalty_last_n: self.repeat_last_n,
            }),
        }
    }

    pub fn inference_parameters(&self) -> InferenceParameters {
        InferenceParameters {
            sampler: self.sampler(),
            maximum_token_count: self.num_predict,
            seed: self.seed,
        }
    }
}

#[derive(Parser, Debug)]
pub struct ModelLoad {
    /// Where to load the model (a GGUF file) from
    #[arg(long, short = 'm', env = "ALPACA_MODEL_PATH")]
    pub model_path: PathBuf,

    /// Sets the size of the context (in tokens). The prompt and the predicted
    /// tokens (`--num-predict`) must fit into it together.
    /// Note that this affects memory.
    #[arg(long, default_value_t = alpaca_base::DEFAULT_CONTEXT_SIZE)]
    pub num_ctx_tokens: usize,

    /// The number of layers to offload to the GPU.
    #[arg(long, default_value_t = 0)]
    pub gpu_layers: u32,
}
impl ModelLoad {
    pub fn load(&self) -> Result<Llama> {
        let params = ModelParameters {
            gpu_layers: self.gpu_layers,
        };
        Llama::load(&self.model_path, params).wrap_err("Could not load model")
    }
}

#[derive(Parser, Debug)]
pub struct PromptFile {
    /// A file to read the prompt template from. It must contain `{{PROMPT}}`.
    ///
    /// The Alpaca instruction template is used when this is not given.
    #[arg(long, short = 'f', default_value = None)]
    pub prompt_file: Option<PathBuf>,
}
impl PromptFile {
    pub fn template(&self) -> Result<PromptTemplate> {
        let Some(path) = &self.prompt_file else {
            return Ok(PromptTemplate::default());
        };

        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read prompt file at {}", path.display()))?;
        PromptTemplate::new(strip_final_newline(contents))
            .wrap_err_with(|| format!("Invalid prompt file at {}", path.display()))
    }
}

/// Strips off a final newline, and a carriage return before it.
fn strip_final_newline(mut prompt: String) -> String {
    if prompt.ends_with('\n') {
        prompt.pop();
    }
    if prompt.ends_with('\r') {
        prompt.pop();
    }
    prompt
}

/// A secret that never shows up in `Debug` output.
#[derive(Clone)]
pub struct DiscordToken(String);
impl DiscordToken {
    pub fn expose(&self) -> &str {
        &self.0
    }
}
impl FromStr for DiscordToken {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}
impl fmt::Debug for DiscordToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiscordToken(<redacted>)")
    }
}
