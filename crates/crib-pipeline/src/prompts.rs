//! Built-in stage prompts and user overrides

use serde::{Deserialize, Serialize};

use crate::session::Stage;

/// Tone of the explanation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Casual,
    Formal,
}

/// Per-stage prompt overrides; a non-empty override replaces the
/// built-in prompt entirely
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOverrides {
    pub clean: Option<String>,
    pub answer: Option<String>,
    pub explain: Option<String>,
}

const CLEAN_PROMPT: &str = "You are a transcription assistant. Rewrite the provided page text as a \
clean transcription of the quiz question it contains. Keep the question wording exactly as \
written, put each answer option on its own line prefixed with \"- \", and drop navigation menus, \
advertisements, cookie banners, and other page chrome. Output only the cleaned text, with no \
commentary.";

const ANSWER_PROMPT: &str = "You are a careful quiz solver. Using only the question text \
provided, determine the correct answer. Respond in exactly this format and nothing else:\n\
Answer: <the correct answer>\n\
Confidence: <High, Medium or Low>\n\
Reason: <one short sentence>";

const EXPLAIN_PROMPT_CASUAL: &str = "You are a friendly tutor. In plain, conversational language, \
explain why the answer to the provided question is correct. Keep it to a few sentences.";

const EXPLAIN_PROMPT_FORMAL: &str = "You are a subject-matter instructor. Give a precise, formal \
explanation of why the answer to the provided question is correct, naming the rule, definition, \
or fact it rests on.";

/// The built-in prompt for a stage
pub fn builtin(stage: Stage, tone: Tone) -> &'static str {
    match (stage, tone) {
        (Stage::Clean, _) => CLEAN_PROMPT,
        (Stage::Answer, _) => ANSWER_PROMPT,
        (Stage::Explain, Tone::Casual) => EXPLAIN_PROMPT_CASUAL,
        (Stage::Explain, Tone::Formal) => EXPLAIN_PROMPT_FORMAL,
    }
}

/// Resolve the prompt for a stage, preferring a non-blank override
pub fn resolve<'a>(stage: Stage, overrides: &'a PromptOverrides, tone: Tone) -> &'a str {
    let override_text = match stage {
        Stage::Clean => overrides.clean.as_deref(),
        Stage::Answer => overrides.answer.as_deref(),
        Stage::Explain => overrides.explain.as_deref(),
    };
    match override_text {
        Some(text) if !text.trim().is_empty() => text,
        _ => builtin(stage, tone),
    }
}
