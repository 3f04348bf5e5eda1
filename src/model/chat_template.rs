//! Chat templates for turning messages into model prompts.
//!
//! Every template ends the rendered prompt with the assistant header so the
//! model continues as the assistant.

use std::{fmt, str::FromStr};

use crate::error::ServiceError;

/// A chat message with a role (`"system"`, `"user"`, `"assistant"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

pub trait ChatTemplate: Send + Sync {
    /// Render the messages, followed by the generation prompt.
    fn apply(&self, messages: &[ChatMessage]) -> String;

    /// Special tokens that terminate an assistant turn.
    fn stop_sequences(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Llama 3.x instruct format.
///
/// ```text
/// <|begin_of_text|><|start_header_id|>user<|end_header_id|>
///
/// {content}<|eot_id|><|start_header_id|>assistant<|end_header_id|>
///
/// ```
pub struct Llama3Template;

impl ChatTemplate for Llama3Template {
    fn apply(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::from("<|begin_of_text|>");
        for msg in messages {
            prompt.push_str("<|start_header_id|>");
            prompt.push_str(&msg.role);
            prompt.push_str("<|end_header_id|>\n\n");
            prompt.push_str(&msg.content);
            prompt.push_str("<|eot_id|>");
        }
        prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        prompt
    }

    fn stop_sequences(&self) -> &'static [&'static str] {
        &["<|eot_id|>", "<|end_of_text|>", "<|eom_id|>"]
    }
}

/// ChatML format used by Qwen and several fine-tunes.
pub struct ChatMlTemplate;

impl ChatTemplate for ChatMlTemplate {
    fn apply(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for msg in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(&msg.role);
            prompt.push('\n');
            prompt.push_str(&msg.content);
            prompt.push_str("<|im_end|>\n");
        }
        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }

    fn stop_sequences(&self) -> &'static [&'static str] {
        &["<|im_end|>", "<|endoftext|>"]
    }
}

/// Concatenates message contents without special tokens, for base models.
pub struct RawTemplate;

impl ChatTemplate for RawTemplate {
    fn apply(&self, messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Llama3,
    ChatMl,
    Raw,
}

impl TemplateKind {
    pub fn build(self) -> Box<dyn ChatTemplate> {
        match self {
            TemplateKind::Llama3 => Box::new(Llama3Template),
            TemplateKind::ChatMl => Box::new(ChatMlTemplate),
            TemplateKind::Raw => Box::new(RawTemplate),
        }
    }
}

impl FromStr for TemplateKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "llama3" | "llama-3" => Ok(TemplateKind::Llama3),
            "chatml" => Ok(TemplateKind::ChatMl),
            "raw" | "none" => Ok(TemplateKind::Raw),
            other => Err(ServiceError::Config(format!(
                "unknown CHAT_TEMPLATE '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateKind::Llama3 => "llama3",
            TemplateKind::ChatMl => "chatml",
            TemplateKind::Raw => "raw",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama3_single_user_turn() {
        let prompt = Llama3Template.apply(&[ChatMessage::user("Hello")]);
        let expected = concat!(
            "<|begin_of_text|>",
            "<|start_header_id|>user<|end_header_id|>\n\n",
            "Hello<|eot_id|>",
            "<|start_header_id|>assistant<|end_header_id|>\n\n",
        );
        assert_eq!(prompt, expected);
    }

    #[test]
    fn llama3_empty_prompt_still_gets_generation_header() {
        let prompt = Llama3Template.apply(&[ChatMessage::user("")]);
        assert!(prompt.contains("<|end_header_id|>\n\n<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn llama3_system_message_comes_first() {
        let prompt = Llama3Template.apply(&[
            ChatMessage::system("You are AgriBot."),
            ChatMessage::user("Hi"),
        ]);
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>system<|end_header_id|>"));
        assert!(prompt.contains("You are AgriBot.<|eot_id|><|start_header_id|>user"));
    }

    #[test]
    fn chatml_single_user_turn() {
        let prompt = ChatMlTemplate.apply(&[ChatMessage::user("Hello")]);
        assert_eq!(
            prompt,
            "<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn raw_template_joins_contents() {
        let prompt = RawTemplate.apply(&[ChatMessage::system("a"), ChatMessage::user("b")]);
        assert_eq!(prompt, "a\nb");
        assert!(RawTemplate.stop_sequences().is_empty());
    }

    #[test]
    fn built_templates_keep_their_stop_sequences() {
        assert_eq!(TemplateKind::Llama3.build().stop_sequences()[0], "<|eot_id|>");
        assert_eq!(TemplateKind::ChatMl.build().stop_sequences()[0], "<|im_end|>");
        assert!(TemplateKind::Raw.build().stop_sequences().is_empty());
    }

    #[test]
    fn kind_round_trips_through_its_name() {
        for kind in [TemplateKind::Llama3, TemplateKind::ChatMl, TemplateKind::Raw] {
            assert_eq!(kind.to_string().parse::<TemplateKind>().unwrap(), kind);
        }
    }
}
