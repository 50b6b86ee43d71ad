//! The base for `alpaca-bot`.
//!
//! This crate knows nothing about any particular inference runtime or chat platform.
//! It defines the [Model] interface that runtimes implement, the prompt building used
//! to turn a chat message into a prompt, the [samplers] that pick tokens, and the
//! [Generator] that drives one prompt evaluation and decode cycle per request. The
//! [InferenceWorker] serializes those requests onto a single thread.
#![deny(missing_docs)]

mod generator;
mod inference_session;
mod prompt;
mod worker;

pub mod model;
pub mod samplers;
pub mod util;

#[cfg(test)]
mod mock_model;

pub use generator::{Completion, Generator, StopReason};
pub use inference_session::{
    InferenceError, InferenceParameters, InferenceSession, InferenceSessionConfig, InferenceStats,
};
pub use model::{Batch, BoxError, Model, ModelContext, ModelError, TokenId};
pub use prompt::{PromptTemplate, TemplateError, Trigger, ALPACA_TEMPLATE, PROMPT_PLACEHOLDER};
pub use samplers::{Greedy, Sampler, SamplerError, TopPTopK};
pub use util::TokenUtf8Buffer;
pub use worker::{InferenceWorker, PendingCompletion, WorkerError, WorkerHandle};

/// The number of tokens a session can hold when nothing else is configured.
pub const DEFAULT_CONTEXT_SIZE: usize = 2048;

/// The maximum number of generated tokens when nothing else is configured.
pub const DEFAULT_MAXIMUM_TOKEN_COUNT: usize = 512;

/// The seed used for sampling when nothing else is configured.
pub const DEFAULT_SEED: u64 = 12354;

/// The message prefix that marks a message as a request for the bot.
pub const DEFAULT_TRIGGER: &str = "alpaca, ";
