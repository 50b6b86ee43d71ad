use std::time::Instant;

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    InferenceError, InferenceParameters, InferenceSession, InferenceSessionConfig, InferenceStats,
    Model, TokenUtf8Buffer,
};

/// Why generation stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The model produced its end-of-text token.
    EndOfText,
    /// [InferenceParameters::maximum_token_count] tokens were generated.
    MaximumTokens,
    /// A step failed after generation started; the text produced until then is kept.
    Interrupted(InferenceError),
}

/// The result of one generation request.
#[derive(Debug)]
pub struct Completion {
    /// The generated text. The prompt is not included.
    pub text: String,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Timing and token counts.
    pub stats: InferenceStats,
}

/// Owns a loaded model and turns prompts into completions.
///
/// Each call to [Generator::generate] runs in a fresh [InferenceSession] that is
/// dropped before the call returns, so calls never observe each other's state.
pub struct Generator<M> {
    model: M,
    session_config: InferenceSessionConfig,
    parameters: InferenceParameters,
}
impl<M: Model> Generator<M> {
    /// Creates a generator for `model`.
    pub fn new(
        model: M,
        session_config: InferenceSessionConfig,
        parameters: InferenceParameters,
    ) -> Self {
        Self {
            model,
            session_config,
            parameters,
        }
    }

    /// The model this generator drives.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The session configuration used for every request.
    pub fn session_config(&self) -> &InferenceSessionConfig {
        &self.session_config
    }

    /// The generation parameters used for every request.
    pub fn parameters(&self) -> &InferenceParameters {
        &self.parameters
    }

    /// Evaluates `prompt` and generates a completion for it.
    ///
    /// `callback` is called with each piece of text as soon as it forms valid UTF-8.
    /// Failures before the first token (context creation, tokenization, an overlong
    /// prompt, evaluating the prompt) are returned as errors; failures afterwards end
    /// generation with [StopReason::Interrupted] and keep the partial text.
    pub fn generate(
        &self,
        prompt: &str,
        mut callback: impl FnMut(&str),
    ) -> Result<Completion, InferenceError> {
        let InferenceParameters {
            sampler,
            maximum_token_count,
            seed,
        } = &self.parameters;
        let maximum_token_count = *maximum_token_count;

        let mut session = InferenceSession::new(&self.model, &self.session_config)?;
        let mut stats = InferenceStats::default();

        let start = Instant::now();
        stats.prompt_tokens = session.feed_prompt(prompt, maximum_token_count)?;
        stats.feed_prompt_duration = start.elapsed();
        log::debug!(
            "fed {} prompt tokens in {}ms",
            stats.prompt_tokens,
            stats.feed_prompt_duration.as_millis()
        );

        let eot = self.model.eot_token_id();
        let mut rng = StdRng::seed_from_u64(*seed);
        let mut buffer = TokenUtf8Buffer::new();
        let mut text = String::new();

        let start = Instant::now();
        let stop_reason = loop {
            if stats.predict_tokens >= maximum_token_count {
                break StopReason::MaximumTokens;
            }

            let token = match session.sample(sampler.as_ref(), &mut rng) {
                Ok(token) => token,
                Err(err) => break StopReason::Interrupted(err),
            };
            if token == eot {
                break StopReason::EndOfText;
            }

            let piece = match self.model.token_to_bytes(token) {
                Ok(piece) => piece,
                Err(err) => break StopReason::Interrupted(err.into()),
            };
            if let Some(s) = buffer.push(&piece) {
                log::trace!("inferred token {token}: {s:?}");
                callback(&s);
                text.push_str(&s);
            }
            stats.predict_tokens += 1;

            // the last token's logits are never read, so it is not evaluated
            if stats.predict_tokens < maximum_token_count {
                if let Err(err) = session.accept(token) {
                    break StopReason::Interrupted(err);
                }
            }
        };
        stats.predict_duration = start.elapsed();

        if let Some(s) = buffer.flush() {
            callback(&s);
            text.push_str(&s);
        }

        match &stop_reason {
            StopReason::Interrupted(err) => log::warn!(
                "generation interrupted after {} tokens: {err}",
                stats.predict_tokens
            ),
            reason => log::debug!(
                "generation stopped ({reason:?}) after {} tokens",
                stats.predict_tokens
            ),
        }

        Ok(Completion {
            text,
            stop_reason,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{mock_model::MockModel, ModelError, TopPTopK};

    fn generator(
        model: MockModel,
        context_size: usize,
        maximum_token_count: usize,
    ) -> Generator<MockModel> {
        Generator::new(
            model,
            InferenceSessionConfig {
                context_size,
                n_threads: 1,
            },
            InferenceParameters {
                maximum_token_count,
                ..Default::default()
            },
        )
    }

    #[test]
    fn stops_at_end_of_text() {
        let generator = generator(MockModel::new(" 4"), 2048, 512);
        let completion = generator.generate("what is 2+2?", |_| {}).unwrap();

        assert_eq!(completion.text, " 4");
        assert!(matches!(completion.stop_reason, StopReason::EndOfText));
        assert_eq!(completion.stats.prompt_tokens, 13);
        assert_eq!(completion.stats.predict_tokens, 2);
        // the prompt, then one evaluation per accepted token
        assert_eq!(generator.model().decode_calls(), 3);
    }

    #[test]
    fn stops_at_maximum_token_count() {
        let generator = generator(MockModel::new("ab").without_end(), 2048, 5);
        let completion = generator.generate("x", |_| {}).unwrap();

        assert_eq!(completion.text, "ababa");
        assert!(matches!(completion.stop_reason, StopReason::MaximumTokens));
        assert_eq!(completion.stats.predict_tokens, 5);
        // the fifth token is never evaluated
        assert_eq!(generator.model().decode_calls(), 5);
    }

    #[test]
    fn settings_are_exposed() {
        let generator = generator(MockModel::new("ok"), 64, 16);
        assert_eq!(generator.session_config().context_size, 64);
        assert_eq!(generator.parameters().maximum_token_count, 16);
        assert_eq!(generator.parameters().seed, crate::DEFAULT_SEED);
    }

    #[test]
    fn zero_token_budget_generates_nothing() {
        let generator = generator(MockModel::new("ab"), 2048, 0);
        let completion = generator.generate("x", |_| {}).unwrap();
        assert_eq!(completion.text, "");
        assert!(matches!(completion.stop_reason, StopReason::MaximumTokens));
    }

    #[test]
    fn output_is_deterministic() {
        let run =
            |generator: &Generator<MockModel>| generator.generate("hello", |_| {}).unwrap().text;

        let greedy = generator(MockModel::new("the same answer"), 2048, 512);
        assert_eq!(run(&greedy), run(&greedy));

        let sampled = Generator::new(
            MockModel::new("xyz").without_end(),
            InferenceSessionConfig::default(),
            InferenceParameters {
                sampler: Arc::new(TopPTopK::default()),
                maximum_token_count: 64,
                seed: 7,
            },
        );
        assert_eq!(run(&sampled), run(&sampled));
    }

    #[test]
    fn overlong_prompt_never_reaches_the_model() {
        let generator = generator(MockModel::new("ok"), 32, 16);
        let err = generator.generate(&"a".repeat(20), |_| {}).unwrap_err();

        assert!(matches!(
            err,
            InferenceError::PromptTooLong {
                prompt_tokens: 21,
                maximum_token_count: 16,
                context_size: 32
            }
        ));
        assert_eq!(generator.model().decode_calls(), 0);
    }

    #[test]
    fn decode_failure_keeps_partial_text() {
        // call 0 is the prompt, calls 1 and 2 accept "a" and "b", call 3 fails on "c"
        let generator = generator(MockModel::new("abcdef").fail_decode_at(3), 2048, 512);
        let completion = generator.generate("x", |_| {}).unwrap();

        assert_eq!(completion.text, "abc");
        assert!(matches!(
            completion.stop_reason,
            StopReason::Interrupted(InferenceError::Model(ModelError::Decode { batch_size: 1, .. }))
        ));
        assert_eq!(completion.stats.predict_tokens, 3);
    }

    #[test]
    fn prompt_failure_is_an_error() {
        let generator = generator(MockModel::new("abc").fail_decode_at(0), 2048, 512);
        let err = generator.generate("x", |_| {}).unwrap_err();
        assert!(matches!(err, InferenceError::Model(ModelError::Decode { .. })));
    }

    #[test]
    fn context_creation_failure_is_an_error() {
        let generator = generator(MockModel::new("abc").fail_context_creation(), 2048, 512);
        let err = generator.generate("x", |_| {}).unwrap_err();
        assert!(matches!(err, InferenceError::Model(ModelError::ContextCreation(_))));
    }

    #[test]
    fn callback_sees_whole_characters() {
        let generator = generator(MockModel::new("a€b"), 2048, 512);
        let mut pieces = vec![];
        let completion = generator
            .generate("x", |piece| pieces.push(piece.to_owned()))
            .unwrap();

        assert_eq!(pieces, vec!["a", "€", "b"]);
        assert_eq!(completion.text, "a€b");
        assert_eq!(completion.stats.predict_tokens, 5);
    }

    #[test]
    fn truncated_character_is_flushed() {
        // "€" is three bytes; stopping after two leaves an incomplete character
        let generator = generator(MockModel::new("a€"), 2048, 3);
        let completion = generator.generate("x", |_| {}).unwrap();
        assert_eq!(completion.text, "a\u{FFFD}");
    }

    #[test]
    fn sessions_are_released_after_each_request() {
        let generator = generator(MockModel::new("ok"), 2048, 512);
        generator.generate("one", |_| {}).unwrap();
        generator.generate("two", |_| {}).unwrap();
        assert_eq!(generator.model().max_in_flight(), 1);
    }
}
