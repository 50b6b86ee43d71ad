use std::{fmt::Display, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{Batch, Greedy, Model, ModelContext, ModelError, Sampler, SamplerError, TokenId};

/// Configuration for an [InferenceSession].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InferenceSessionConfig {
    /// The number of tokens (prompt and generated) the session can hold.
    pub context_size: usize,
    /// The number of threads to use for evaluation.
    pub n_threads: usize,
}
impl Default for InferenceSessionConfig {
    fn default() -> Self {
        Self {
            context_size: crate::DEFAULT_CONTEXT_SIZE,
            n_threads: 8,
        }
    }
}

#[derive(Clone, Debug)]
/// The parameters that drive text generation.
pub struct InferenceParameters {
    /// The sampler used to pick each token.
    pub sampler: Arc<dyn Sampler>,
    /// The maximum number of tokens to generate for one request.
    pub maximum_token_count: usize,
    /// The seed for the random number generator. A fresh generator is seeded
    /// with this value for every request.
    pub seed: u64,
}
impl Default for InferenceParameters {
    fn default() -> Self {
        Self {
            sampler: Arc::new(Greedy),
            maximum_token_count: crate::DEFAULT_MAXIMUM_TOKEN_COUNT,
            seed: crate::DEFAULT_SEED,
        }
    }
}

#[derive(Error, Debug)]
/// Errors encountered during the inference process.
pub enum InferenceError {
    #[error("{0}")]
    /// The model reported an error.
    Model(#[from] ModelError),
    #[error("the prompt did not produce any tokens")]
    /// Tokenization succeeded but produced nothing to evaluate.
    EmptyPrompt,
    #[error(
        "the prompt is {prompt_tokens} tokens long; with room for {maximum_token_count} generated \
         tokens this exceeds the context size of {context_size} tokens"
    )]
    /// The prompt and the generation budget do not fit into the context window.
    PromptTooLong {
        /// The number of tokens in the prompt.
        prompt_tokens: usize,
        /// The configured maximum number of generated tokens.
        maximum_token_count: usize,
        /// The number of tokens the context can hold.
        context_size: usize,
    },
    #[error("{0}")]
    /// The sampler could not pick a token.
    Sampler(#[from] SamplerError),
}

/// Statistics about one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InferenceStats {
    /// How long it took to feed the prompt.
    pub feed_prompt_duration: Duration,
    /// How many tokens the prompt was.
    pub prompt_tokens: usize,
    /// How long it took to predict new tokens.
    pub predict_duration: Duration,
    /// The number of predicted tokens.
    pub predict_tokens: usize,
}
impl InferenceStats {
    /// Predicted tokens per second, if any time was spent predicting.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.predict_duration.as_secs_f64();
        (secs > 0.0).then(|| self.predict_tokens as f64 / secs)
    }
}
impl Display for InferenceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            feed_prompt_duration,
            prompt_tokens,
            predict_duration,
            predict_tokens,
        } = *self;

        let predict_duration_ms = predict_duration.as_millis();
        let per_token_ms = if predict_tokens == 0 {
            0.0
        } else {
            predict_duration_ms as f64 / predict_tokens as f64
        };

        writeln!(f, "feed_prompt_duration: {}ms", feed_prompt_duration.as_millis())?;
        writeln!(f, "prompt_tokens: {prompt_tokens}")?;
        writeln!(f, "predict_duration: {predict_duration_ms}ms")?;
        writeln!(f, "predict_tokens: {predict_tokens}")?;
        write!(f, "per_token_duration: {per_token_ms:.3}ms")
    }
}

/// The state of one request against a [Model].
///
/// A session owns the runtime context (and with it the key/value cache), the
/// tokens evaluated so far and the batch buffer. It is created for one prompt and
/// dropped afterwards; all of its resources are released when it goes out of scope.
pub struct InferenceSession<'m, M: Model + 'm> {
    model: &'m M,
    context: M::Context<'m>,
    tokens: Vec<TokenId>,
    batch: Batch,
}
impl<'m, M: Model> InferenceSession<'m, M> {
    /// Creates a fresh context for `model`.
    pub fn new(model: &'m M, config: &InferenceSessionConfig) -> Result<Self, InferenceError> {
        let context = model.new_context(config)?;
        Ok(Self {
            model,
            context,
            tokens: Vec::with_capacity(config.context_size),
            batch: Batch::default(),
        })
    }

    /// The number of tokens this session can hold.
    pub fn context_size(&self) -> usize {
        self.context.context_size()
    }

    /// The position of the next token.
    pub fn n_past(&self) -> usize {
        self.tokens.len()
    }

    /// Every token evaluated so far, prompt first.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Tokenizes `prompt` and evaluates it as a single batch, reserving space for
    /// `maximum_token_count` generated tokens.
    ///
    /// The prompt is rejected before any evaluation if it does not leave that much
    /// room in the context. Returns the number of prompt tokens.
    pub fn feed_prompt(
        &mut self,
        prompt: &str,
        maximum_token_count: usize,
    ) -> Result<usize, InferenceError> {
        let prompt_tokens = self.model.tokenize(prompt, self.tokens.is_empty())?;
        if prompt_tokens.is_empty() {
            return Err(InferenceError::EmptyPrompt);
        }

        let context_size = self.context_size();
        let required = self.tokens.len() + prompt_tokens.len() + maximum_token_count;
        if required > context_size {
            return Err(InferenceError::PromptTooLong {
                prompt_tokens: self.tokens.len() + prompt_tokens.len(),
                maximum_token_count,
                context_size,
            });
        }

        self.batch = Batch::with_capacity(prompt_tokens.len());
        let start = self.tokens.len();
        for (i, &token) in prompt_tokens.iter().enumerate() {
            self.batch.add(token, start + i, false);
        }
        // only the final position's logits are needed to pick the first token
        self.batch.request_last_logits();

        self.context.decode(&self.batch)?;
        self.tokens.extend_from_slice(&prompt_tokens);

        log::trace!("evaluated {} prompt tokens", prompt_tokens.len());
        Ok(prompt_tokens.len())
    }

    /// Samples the next token from the logits of the last evaluated position.
    pub fn sample(
        &self,
        sampler: &dyn Sampler,
        rng: &mut dyn rand::RngCore,
    ) -> Result<TokenId, InferenceError> {
        let last = self.batch.len().checked_sub(1).ok_or(InferenceError::EmptyPrompt)?;
        let logits = self.context.logits(last);
        Ok(sampler.sample(&self.tokens, logits, rng)?)
    }

    /// Evaluates `token` at the next position, making its logits available to
    /// [InferenceSession::sample].
    pub fn accept(&mut self, token: TokenId) -> Result<(), InferenceError> {
        debug_assert!(self.tokens.len() < self.context_size());

        self.batch.clear();
        self.batch.add(token, self.tokens.len(), true);
        self.context.decode(&self.batch)?;
        self.tokens.push(token);
        Ok(())
    }
}
