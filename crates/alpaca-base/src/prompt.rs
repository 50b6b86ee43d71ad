use thiserror::Error;

/// The placeholder in a [PromptTemplate] that is replaced by the instruction.
pub const PROMPT_PLACEHOLDER: &str = "{{PROMPT}}";

/// The Alpaca instruction-following template.
pub const ALPACA_TEMPLATE: &str = "\n\n### Instruction: Below is an instruction \
    that describes a task. Write a response that appropriately completes the request.\n\n\
    ### Input:\n\n{{PROMPT}}\n\n\
    ### Response:\n\n";

/// A literal message prefix that marks a message as a request for the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger(String);
impl Trigger {
    /// Creates a trigger for `prefix`. Matching is exact and case-sensitive.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// The prefix this trigger matches.
    pub fn prefix(&self) -> &str {
        &self.0
    }

    /// Returns the text after the prefix, untouched, or `None` if `text` does not
    /// start with the prefix.
    pub fn extract<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.strip_prefix(self.0.as_str())
    }
}
impl Default for Trigger {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TRIGGER)
    }
}

/// A prompt with a single [PROMPT_PLACEHOLDER] substitution point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate(String);
impl PromptTemplate {
    /// Creates a template, failing if `template` has no placeholder.
    pub fn new(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        if !template.contains(PROMPT_PLACEHOLDER) {
            return Err(TemplateError::MissingPlaceholder);
        }
        Ok(Self(template))
    }

    /// Substitutes `instruction` into the template.
    pub fn render(&self, instruction: &str) -> String {
        self.0.replace(PROMPT_PLACEHOLDER, instruction)
    }
}
impl Default for PromptTemplate {
    fn default() -> Self {
        Self(ALPACA_TEMPLATE.to_owned())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors encountered while building a [PromptTemplate].
pub enum TemplateError {
    #[error("the prompt template does not contain the `{{{{PROMPT}}}}` placeholder")]
    /// The template has nowhere to put the instruction.
    MissingPlaceholder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_ignores_messages_without_prefix() {
        let trigger = Trigger::default();
        assert_eq!(trigger.extract("what is 2+2?"), None);
        assert_eq!(trigger.extract("Alpaca, what is 2+2?"), None);
        assert_eq!(trigger.extract("alpaca,what is 2+2?"), None);
        assert_eq!(trigger.extract("hey alpaca, what is 2+2?"), None);
        assert_eq!(trigger.extract(""), None);
    }

    #[test]
    fn trigger_keeps_instruction_byte_for_byte() {
        let trigger = Trigger::default();
        assert_eq!(trigger.extract("alpaca, what is 2+2?"), Some("what is 2+2?"));
        assert_eq!(
            trigger.extract("alpaca,   spaced \t out\n\nlines  "),
            Some("  spaced \t out\n\nlines  ")
        );
        assert_eq!(trigger.extract("alpaca, "), Some(""));
    }

    #[test]
    fn template_substitutes_instruction() {
        let template = PromptTemplate::default();
        let prompt = template.render("what is 2+2?");
        assert_eq!(
            prompt,
            "\n\n### Instruction: Below is an instruction that describes a task. Write a \
             response that appropriately completes the request.\n\n### Input:\n\n\
             what is 2+2?\n\n### Response:\n\n"
        );
    }

    #[test]
    fn template_does_not_rescan_instruction() {
        let template = PromptTemplate::new("<{{PROMPT}}>").unwrap();
        assert_eq!(
            template.render("{{PROMPT}} and {{PROMPT}}"),
            "<{{PROMPT}} and {{PROMPT}}>"
        );
    }

    #[test]
    fn template_requires_placeholder() {
        assert_eq!(
            PromptTemplate::new("no placeholder here"),
            Err(TemplateError::MissingPlaceholder)
        );
        assert_eq!(
            TemplateError::MissingPlaceholder.to_string(),
            "the prompt template does not contain the `{{PROMPT}}` placeholder"
        );
    }

    #[test]
    fn end_to_end_message_becomes_prompt() {
        let trigger = Trigger::default();
        let instruction = trigger.extract("alpaca, what is 2+2?").unwrap();
        assert_eq!(instruction, "what is 2+2?");
        assert_eq!(
            PromptTemplate::default().render(instruction),
            ALPACA_TEMPLATE.replace("{{PROMPT}}", "what is 2+2?")
        );
    }
}
