//! Prompt assembly for the dialog and the transcriber.
//!
//! Templates use numbered placeholders: `{0}` person, `{1}` bot name,
//! `{2}` local time as HH:MM, `{3}` year, `{4}` the chat symbol.

use chrono::{DateTime, Local};
use std::path::Path;

pub const CHAT_SYMBOL: &str = ":";

pub const TRANSCRIBER_PROMPT: &str = "A conversation with a person called {1}.";

pub const DEFAULT_DIALOG: &str = "Text transcript of a never ending dialog, where {0} interacts with an AI assistant named {1}.
{1} is helpful, kind, honest, friendly, good at writing and never fails to answer {0}’s requests immediately and with details and precision.
There are no annotations like (30 seconds passed...) or (to himself), just what {0} and {1} say aloud to each other.
The transcript only includes text, it does not include markup like HTML and Markdown.
{1} responds with short and concise answers.

{0}{4} Hello, {1}!
{1}{4} Hello {0}! How may I help you today?
{0}{4} What time is it?
{1}{4} It is {2} o'clock.
{0}{4} What year is it?
{1}{4} We are in {3}.
{0}{4} What is a cat?
{1}{4} A cat is a domestic species of small carnivorous mammal. It is the only domesticated species in the family Felidae.
{0}{4} Name a color.
{1}{4} Blue
{0}{4}";

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_DIALOG)
    }
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Load a template file; one trailing newline is dropped.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let text = text
            .strip_suffix("\r\n")
            .or_else(|| text.strip_suffix('\n'))
            .unwrap_or(&text);
        Ok(Self::new(text))
    }

    /// Fill in the placeholders. The result starts with a single space.
    pub fn render(&self, person: &str, bot_name: &str, now: DateTime<Local>) -> String {
        let mut prompt = String::with_capacity(self.template.len() + 1);
        prompt.push(' ');
        prompt.push_str(&self.template);
        prompt
            .replace("{0}", person)
            .replace("{1}", bot_name)
            .replace("{2}", &now.format("%H:%M").to_string())
            .replace("{3}", &now.format("%Y").to_string())
            .replace("{4}", CHAT_SYMBOL)
    }
}

/// Prompt that biases the transcriber towards the bot's name.
pub fn transcriber_prompt(bot_name: &str) -> String {
    TRANSCRIBER_PROMPT.replace("{1}", bot_name)
}

/// Marker whose appearance hands the turn back to the user.
pub fn antiprompt(person: &str) -> String {
    format!("{}{}", person, CHAT_SYMBOL)
}

/// The text appended to the history for one user turn.
pub fn user_turn(heard: &str, bot_name: &str) -> String {
    format!(" {}\n{}{}", heard, bot_name, CHAT_SYMBOL)
}
