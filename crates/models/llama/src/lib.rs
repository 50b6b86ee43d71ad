//! An implementation of the `alpaca-base` [Model] interface on top of
//! [llama.cpp](https://github.com/ggerganov/llama.cpp), for GGUF model files.
#![deny(missing_docs)]

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Instant,
};

use alpaca_base::{
    Batch, BoxError, InferenceSessionConfig, Model, ModelContext, ModelError, TokenId,
};
use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    token::LlamaToken,
    LlamaCppError, LlamaModelLoadError,
};
use thiserror::Error;

/// Parameters for loading a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelParameters {
    /// The number of layers to offload to the GPU. `0` keeps the whole model on the CPU.
    pub gpu_layers: u32,
}

#[derive(Error, Debug)]
/// Errors encountered while loading a model.
pub enum LoadError {
    #[error("could not find file {path:?}")]
    /// A file failed to open.
    FileDoesNotExist {
        /// The path that failed.
        path: PathBuf,
    },
    #[error("failed to initialize the llama.cpp backend: {0}")]
    /// The llama.cpp backend could not be initialized.
    Backend(#[source] LlamaCppError),
    #[error("could not load the model at {path:?}: {source}")]
    /// The file exists, but llama.cpp could not load it.
    InvalidModel {
        /// The path that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: LlamaModelLoadError,
    },
}

/// A model loaded by llama.cpp.
pub struct Llama {
    // dropped before the backend
    model: LlamaModel,
    backend: LlamaBackend,
}
impl Llama {
    /// Loads the model at `path`.
    ///
    /// This initializes the llama.cpp backend, which can only happen once per process.
    pub fn load(path: &Path, params: ModelParameters) -> Result<Self, LoadError> {
        if !path.exists() {
            return Err(LoadError::FileDoesNotExist {
                path: path.to_owned(),
            });
        }

        let backend = LlamaBackend::init().map_err(LoadError::Backend)?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);

        log::info!("Loading model from '{}'", path.display());
        let start = Instant::now();
        let model = LlamaModel::load_from_file(&backend, path, &model_params).map_err(|source| {
            LoadError::InvalidModel {
                path: path.to_owned(),
                source,
            }
        })?;
        log::info!(
            "Loaded model in {}ms ({} vocabulary tokens, {} trained context tokens, {} GPU layers)",
            start.elapsed().as_millis(),
            model.n_vocab(),
            model.n_ctx_train(),
            params.gpu_layers
        );

        Ok(Self { model, backend })
    }
}

impl Model for Llama {
    type Context<'m> = LlamaSessionContext<'m>;

    fn new_context(
        &self,
        config: &InferenceSessionConfig,
    ) -> Result<Self::Context<'_>, ModelError> {
        let threads = i32::try_from(config.n_threads).unwrap_or(i32::MAX);
        let params = LlamaContextParams::default()
            .with_n_ctx(context_length(config.context_size))
            // the whole prompt is evaluated as one batch
            .with_n_batch(u32::try_from(config.context_size).unwrap_or(u32::MAX))
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = self
            .model
            .new_context(&self.backend, params)
            .map_err(|err| ModelError::ContextCreation(Box::new(err)))?;

        Ok(LlamaSessionContext {
            context,
            batch: LlamaBatch::new(config.context_size.max(1), 1),
        })
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ModelError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|err| ModelError::Tokenization(Box::new(err)))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    #[allow(deprecated)]
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, ModelError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Plaintext)
            .map_err(|err| ModelError::Detokenize {
                token,
                source: Box::new(err),
            })
    }

    fn eot_token_id(&self) -> TokenId {
        self.model.token_eos().0
    }
}

fn context_length(context_size: usize) -> Option<NonZeroU32> {
    u32::try_from(context_size).ok().and_then(NonZeroU32::new)
}

/// A llama.cpp context (key/value cache and logits) for one session.
pub struct LlamaSessionContext<'m> {
    context: LlamaContext<'m>,
    batch: LlamaBatch,
}
impl ModelContext for LlamaSessionContext<'_> {
    fn context_size(&self) -> usize {
        self.context.n_ctx() as usize
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), ModelError> {
        let decode_error = |source: BoxError| ModelError::Decode {
            batch_size: batch.len(),
            source,
        };

        self.batch.clear();
        for (token, position, logits) in batch.iter() {
            let position = i32::try_from(position).map_err(|err| decode_error(Box::new(err)))?;
            self.batch
                .add(LlamaToken::new(token), position, &[0], logits)
                .map_err(|err| decode_error(Box::new(err)))?;
        }

        self.context
            .decode(&mut self.batch)
            .map_err(|err| decode_error(Box::new(err)))
    }

    fn logits(&self, index: usize) -> &[f32] {
        self.context
            .get_logits_ith(i32::try_from(index).unwrap_or(i32::MAX))
    }
}
