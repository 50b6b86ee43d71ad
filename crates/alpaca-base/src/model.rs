//! Large language model traits and types

use thiserror::Error;

use crate::InferenceSessionConfig;

/// The identifier of a token in a model's vocabulary.
pub type TokenId = i32;

/// A boxed error from an inference runtime.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Interfaces for interacting with a loaded large language model.
///
/// The model itself is read-only after loading and can be shared freely. All mutable
/// state (the key/value cache and the logits of the last evaluation) lives in a
/// [ModelContext], which is created per request by [Model::new_context].
pub trait Model: Send + Sync {
    /// The evaluation context for this model.
    type Context<'m>: ModelContext
    where
        Self: 'm;

    /// Creates a new evaluation context, sized according to `config`.
    fn new_context(
        &self,
        config: &InferenceSessionConfig,
    ) -> Result<Self::Context<'_>, ModelError>;

    /// Converts `text` to tokens. If `add_bos` is set, the beginning-of-text token
    /// is prepended.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ModelError>;

    /// Converts a single token to the bytes it represents. The bytes are not
    /// necessarily valid UTF-8 on their own.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, ModelError>;

    /// Get the end of text/end of string token ID.
    fn eot_token_id(&self) -> TokenId;
}

/// The mutable evaluation state of a [Model].
pub trait ModelContext {
    /// The number of tokens this context can hold.
    fn context_size(&self) -> usize;

    /// Runs the model over `batch`. Afterwards, [ModelContext::logits] is available for
    /// every entry of the batch that requested logits.
    fn decode(&mut self, batch: &Batch) -> Result<(), ModelError>;

    /// The logits for the `index`th entry of the last decoded batch.
    ///
    /// Implementations may panic if logits were not requested for that entry.
    fn logits(&self, index: usize) -> &[f32];
}

/// A batch of tokens to evaluate in a single forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<usize>,
    logits: Vec<bool>,
}
impl Batch {
    /// Creates an empty batch with space for `capacity` tokens.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
        }
    }

    /// Adds `token` at `position`; if `logits` is set, its logits are produced.
    pub fn add(&mut self, token: TokenId, position: usize, logits: bool) {
        self.tokens.push(token);
        self.positions.push(position);
        self.logits.push(logits);
    }

    /// Removes every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.logits.clear();
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Requests logits for the last entry, if any.
    pub fn request_last_logits(&mut self) {
        if let Some(last) = self.logits.last_mut() {
            *last = true;
        }
    }

    /// Iterates over `(token, position, logits)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (TokenId, usize, bool)> + '_ {
        self.tokens
            .iter()
            .zip(&self.positions)
            .zip(&self.logits)
            .map(|((&token, &position), &logits)| (token, position, logits))
    }
}

#[derive(Error, Debug)]
/// Errors reported by a [Model] implementation.
pub enum ModelError {
    #[error("failed to create an inference context: {0}")]
    /// The runtime could not allocate a context.
    ContextCreation(#[source] BoxError),
    #[error("failed to tokenize the prompt: {0}")]
    /// The tokenizer rejected the text.
    Tokenization(#[source] BoxError),
    #[error("failed to evaluate {batch_size} token(s): {source}")]
    /// A forward pass failed.
    Decode {
        /// The number of tokens in the failed batch.
        batch_size: usize,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
    #[error("failed to convert token {token} to text: {source}")]
    /// A token could not be converted back to text.
    Detokenize {
        /// The token that failed.
        token: TokenId,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}
