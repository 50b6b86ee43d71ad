//! Defines the samplers used for generation.
//!
//! The default is [Greedy], which always picks the most likely token and never
//! touches the random number generator. You can define your own [Sampler] by
//! implementing the trait.

use std::fmt::Debug;

use partial_sort::PartialSort;
use rand::{distributions::WeightedIndex, prelude::Distribution};
use thiserror::Error;

use crate::TokenId;

/// A sampler for generation.
pub trait Sampler: Debug + Send + Sync {
    /// Given the previous tokens, the logits from the most recent evaluation, and a source of
    /// randomness, sample from the logits and return the token ID.
    fn sample(
        &self,
        previous_tokens: &[TokenId],
        logits: &[f32],
        rng: &mut dyn rand::RngCore,
    ) -> Result<TokenId, SamplerError>;
}

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors encountered while sampling.
pub enum SamplerError {
    #[error("there were no logits to sample from")]
    /// The model produced an empty logit vector.
    EmptyLogits,
}

/// Greedy sampling: the token with the highest logit wins.
///
/// Ties go to the lowest token ID, so the result only depends on the logits.
#[derive(Clone, Copy, Debug, Default)]
pub struct Greedy;
impl Sampler for Greedy {
    fn sample(
        &self,
        _previous_tokens: &[TokenId],
        logits: &[f32],
        _rng: &mut dyn rand::RngCore,
    ) -> Result<TokenId, SamplerError> {
        argmax(logits)
            .map(|i| i as TokenId)
            .ok_or(SamplerError::EmptyLogits)
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &value) in values.iter().enumerate() {
        match best {
            Some((_, best_value)) if value.total_cmp(&best_value).is_le() => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i)
}

/// Top-P Top-K sampling.
///
/// A standard sampler that uses top-K sampling (the top-K tokens with the highest
/// probability are considered) and top-P sampling (only tokens with a cumulative
/// probability of `P` are considered).
///
/// It also implements [CTRL](https://arxiv.org/abs/1909.05858)'s repetition penalty.
#[derive(Clone, Debug)]
pub struct TopPTopK {
    /// The top K words by score are kept during sampling.
    pub top_k: usize,
    /// The cumulative probability after which no more words are kept for sampling.
    pub top_p: f32,
    /// The penalty for repeating tokens. Higher values make the generation less
    /// likely to get into a loop, but may harm results when repetitive outputs
    /// are desired.
    pub repeat_penalty: f32,
    /// Temperature (randomness) used for sampling. A higher number is more random.
    pub temperature: f32,
    /// The number of tokens to consider for the repetition penalty.
    pub repetition_penalty_last_n: usize,
}
impl Default for TopPTopK {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.30,
            temperature: 0.80,
            repetition_penalty_last_n: 64,
        }
    }
}
impl Sampler for TopPTopK {
    fn sample(
        &self,
        previous_tokens: &[TokenId],
        logits: &[f32],
        rng: &mut dyn rand::RngCore,
    ) -> Result<TokenId, SamplerError> {
        let Self {
            top_k,
            top_p,
            repeat_penalty,
            temperature,
            repetition_penalty_last_n,
        } = *self;

        if logits.is_empty() {
            return Err(SamplerError::EmptyLogits);
        }
        let top_k = top_k.clamp(1, logits.len());

        let recent_tokens =
            &previous_tokens[previous_tokens.len().saturating_sub(repetition_penalty_last_n)..];

        let scale = 1.0 / temperature;
        let mut logits_id: Vec<(f32, TokenId)> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| {
                let tid = i as TokenId;
                let val = if recent_tokens.contains(&tid) {
                    // repetition penalty from CTRL paper (https://arxiv.org/abs/1909.05858)
                    // if score < 0 then repetition penalty has to multiplied to reduce the previous
                    // token probability
                    if logit < 0.0 {
                        logit * scale * repeat_penalty
                    } else {
                        logit * scale / repeat_penalty
                    }
                } else {
                    logit * scale
                };
                (val, tid)
            })
            .collect();

        // find the top K tokens
        logits_id.partial_sort(top_k, |a, b| {
            // Sort descending
            b.0.total_cmp(&a.0)
        });
        logits_id.truncate(top_k);

        let maxl = logits_id[0].0;

        // compute probs for the top K tokens
        let mut probs: Vec<f32> = logits_id
            .iter()
            .map(|&(k, _)| (k - maxl).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        if top_p < 1.0 {
            let mut cumsum = 0.0;
            for i in 0..probs.len() {
                cumsum += probs[i];
                if cumsum >= top_p {
                    probs.truncate(i + 1);
                    logits_id.truncate(i + 1);
                    break;
                }
            }

            cumsum = 1.0 / cumsum;
            for p in probs.iter_mut() {
                *p *= cumsum;
            }
        }

        // Degenerate distributions (NaN or zero weights) fall back to the most likely token.
        let idx = match WeightedIndex::new(&probs) {
            Ok(dist) => dist.sample(rng),
            Err(err) => {
                log::warn!("could not build a sampling distribution ({err}), using the top token");
                0
            }
        };

        Ok(logits_id[idx].1)
    }
}
