//! Best-effort parsing of the structured answer format

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence label embedded in the answer format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Display name matching the answer format ("High", "Medium", "Low")
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "High" => Some(Confidence::High),
            "Medium" => Some(Confidence::Medium),
            "Low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

/// Result of parsing an answer-stage response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    /// The answer portion; the whole input when the format is absent
    pub answer: String,
    pub confidence: Option<Confidence>,
    pub reason: Option<String>,
}

/// The `Answer:/Confidence:/Reason:` format the answer prompt pins.
/// The format is prompt-enforced only, so a match requires the answer
/// and confidence labels; the reason is optional.
static ANSWER_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)Answer:\s*(?P<answer>.*?)\s*Confidence:\s*(?P<confidence>High|Medium|Low)(?:\s*Reason:\s*(?P<reason>.*?))?\s*$",
    )
    .unwrap()
});

/// Parse answer-stage output, falling back to the whole text when the
/// expected format is absent
pub fn parse_answer(text: &str) -> ParsedAnswer {
    match ANSWER_FORMAT.captures(text) {
        Some(caps) => ParsedAnswer {
            answer: caps["answer"].to_string(),
            confidence: Confidence::from_label(&caps["confidence"]),
            reason: caps
                .name("reason")
                .map(|m| m.as_str().trim().to_string())
                .filter(|r| !r.is_empty()),
        },
        None => ParsedAnswer {
            answer: text.trim().to_string(),
            confidence: None,
            reason: None,
        },
    }
}
