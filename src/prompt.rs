//! Conversation to prompt-string formatting.
//!
//! Two layouts are supported. `Transcript` renders every turn as
//! `"<Role>: <content>\n\n"` and ends with `"Assistant:"` so the model
//! continues as the assistant. `Instruct` packs a single system/user pair
//! into the `<s>[INST] ... [/INST]` envelope used by Mistral-style models.
//! Everything here is pure.

use std::{fmt, str::FromStr};

use crate::model::{Message, Role};

pub const BOS_MARKER: &str = "<s>";
pub const INSTRUCTION_OPEN: &str = "[INST]";
pub const INSTRUCTION_CLOSE: &str = "[/INST]";
pub const ASSISTANT_TURN: &str = "Assistant:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Transcript,
    Instruct,
}

impl FromStr for PromptStyle {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "transcript" | "chat" => Ok(PromptStyle::Transcript),
            "instruct" | "inst" | "mistral" => Ok(PromptStyle::Instruct),
            other => Err(format!("unknown prompt style `{other}`")),
        }
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptStyle::Transcript => f.write_str("transcript"),
            PromptStyle::Instruct => f.write_str("instruct"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptFormatter {
    style: PromptStyle,
    default_system: Option<String>,
}

impl PromptFormatter {
    pub fn new(style: PromptStyle, default_system: Option<String>) -> Self {
        Self {
            style,
            default_system,
        }
    }

    pub fn style(&self) -> PromptStyle {
        self.style
    }

    /// Formats a chat conversation for the configured style.
    pub fn format_chat(&self, messages: &[Message]) -> String {
        let default_system = self.default_system.as_deref();
        match self.style {
            PromptStyle::Transcript => format_transcript(messages, default_system),
            PromptStyle::Instruct => {
                let system = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::System)
                    .map(|m| m.content.as_str())
                    .or(default_system);
                // Only the latest user turn survives this layout.
                let user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                format_instruction(system, user)
            }
        }
    }

    /// Formats a raw completion prompt. Transcript style sends it untouched.
    pub fn format_completion(&self, prompt: &str) -> String {
        match self.style {
            PromptStyle::Transcript => prompt.to_string(),
            PromptStyle::Instruct => format_instruction(self.default_system.as_deref(), prompt),
        }
    }
}

/// Renders turns in order and appends the assistant turn marker.
///
/// `default_system` is prepended only when the conversation carries no
/// system message of its own.
pub fn format_transcript(messages: &[Message], default_system: Option<&str>) -> String {
    let mut formatted = String::new();

    if !messages.iter().any(|m| m.role == Role::System) {
        if let Some(system) = default_system {
            push_turn(&mut formatted, Role::System, system);
        }
    }
    for message in messages {
        push_turn(&mut formatted, message.role, &message.content);
    }

    formatted.push_str(ASSISTANT_TURN);
    formatted
}

fn push_turn(buf: &mut String, role: Role, content: &str) {
    buf.push_str(role.label());
    buf.push_str(": ");
    buf.push_str(content);
    buf.push_str("\n\n");
}

/// Wraps a system/user pair in the instruction envelope. Text that already
/// carries an instruction marker is returned unchanged.
pub fn format_instruction(system: Option<&str>, user: &str) -> String {
    if is_instruction_wrapped(user) {
        return user.to_string();
    }
    match system {
        Some(system) => format!("{BOS_MARKER}{INSTRUCTION_OPEN} {system}\n\n{user} {INSTRUCTION_CLOSE}"),
        None => format!("{BOS_MARKER}{INSTRUCTION_OPEN} {user} {INSTRUCTION_CLOSE}"),
    }
}

pub fn is_instruction_wrapped(text: &str) -> bool {
    text.contains(INSTRUCTION_OPEN)
}
