//! Turning generation outcomes into Discord messages.

use alpaca_base::{Completion, InferenceError, StopReason, WorkerError};

/// The maximum length of a Discord message, in characters.
pub const MESSAGE_LIMIT: usize = 2000;

/// The text to reply with for the outcome of a request.
pub fn format_outcome(outcome: &Result<Completion, WorkerError>) -> String {
    match outcome {
        Ok(Completion {
            text,
            stop_reason: StopReason::Interrupted(err),
            ..
        }) => {
            if text.trim().is_empty() {
                format!("Sorry, I could not answer that: {err}")
            } else {
                format!("{text}\n\n*(stopped early: {err})*")
            }
        }
        Ok(Completion { text, .. }) if text.trim().is_empty() => {
            "*(the model did not say anything)*".to_owned()
        }
        Ok(Completion { text, .. }) => text.clone(),
        Err(WorkerError::Inference(InferenceError::PromptTooLong {
            prompt_tokens,
            maximum_token_count,
            context_size,
        })) => format!(
            "Sorry, your message is too long: the prompt is {prompt_tokens} tokens, and with \
             {maximum_token_count} tokens reserved for the answer it does not fit into \
             {context_size} tokens."
        ),
        Err(WorkerError::Busy) => {
            "I'm busy answering other messages, please try again in a moment.".to_owned()
        }
        Err(err) => format!("Sorry, something went wrong: {err}"),
    }
}

/// Splits `text` into chunks of at most `limit` characters, breaking after the
/// last newline that fits where possible.
///
/// Every chunk contains some non-whitespace text. Whitespace at the start of a chunk
/// is dropped, as Discord trims it anyway and rejects messages that are only whitespace.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = vec![];
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        let end = match rest.char_indices().nth(limit) {
            Some((end, _)) => end,
            None => {
                chunks.push(rest.to_owned());
                break;
            }
        };
        let window = &rest[..end];
        let end = window.rfind('\n').map_or(end, |newline| newline + 1);
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk.to_owned());
        rest = tail.trim_start();
    }
    chunks
}
