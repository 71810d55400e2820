//! Request and response types for the Gemini generation endpoint

use serde::{Deserialize, Serialize};

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.4;

/// Recognized generation options for a request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sampling temperature in [0, 1]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// One generation exchange: a system prompt framing the task and the
/// user content it applies to
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_content: String,
    pub config: GenerationConfig,
}

/// Token usage reported by the endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

// Wire types. The endpoint accepts `system_instruction` in snake_case
// while `generationConfig` is camelCase only.

#[derive(Debug, Serialize)]
pub(crate) struct GeminiRequest {
    pub system_instruction: GeminiContent,
    pub contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GeminiGenerationConfig,
}

impl GeminiRequest {
    pub(crate) fn from_request(request: &GenerateRequest) -> Self {
        Self {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: request.system_prompt.clone(),
                }],
            },
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: request.user_content.clone(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: request.config.temperature,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
pub(crate) struct GeminiPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct GeminiGenerationConfig {
    pub temperature: f32,
}

// Response types. Every level is optional so a chunk that omits part of
// the expected path parses instead of failing the whole stream.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    pub usage_metadata: Option<GeminiUsageMetadata>,
}

impl GeminiResponse {
    /// Text fragment at `candidates[0].content.parts[].text`, when present
    pub(crate) fn text_delta(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
        if text.is_empty() { None } else { Some(text) }
    }

    /// Token usage, when the chunk reports it
    pub(crate) fn usage(&self) -> Option<TokenUsage> {
        self.usage_metadata.as_ref().map(|u| TokenUsage {
            input: u.prompt_token_count.unwrap_or(0),
            output: u.candidates_token_count.unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiCandidate {
    pub content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiResponseContent {
    #[serde(default)]
    pub parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiResponsePart {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiUsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiErrorBody {
    pub error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiErrorDetail {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let request = GenerateRequest {
            system_prompt: "be brief".to_string(),
            user_content: "hello".to_string(),
            config: GenerationConfig { temperature: 0.5 },
        };
        let body = serde_json::to_value(GeminiRequest::from_request(&request)).unwrap();

        assert_eq!(body["system_instruction"]["parts"][0]["text"], "be brief");
        assert!(body["system_instruction"].get("role").is_none());
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
    }

    #[test]
    fn test_response_text_delta_at_expected_path() {
        let chunk: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"content":{"parts":[{"text":"abc"}]}}]}"#)
                .unwrap();
        assert_eq!(chunk.text_delta().as_deref(), Some("abc"));
    }

    #[test]
    fn test_response_joins_multiple_parts() {
        let chunk: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"ab"},{"text":"cd"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.text_delta().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_response_tolerates_absent_paths() {
        for raw in [
            r#"{}"#,
            r#"{"candidates":[]}"#,
            r#"{"candidates":[{}]}"#,
            r#"{"candidates":[{"content":null}]}"#,
            r#"{"candidates":[{"content":{"parts":[]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{}]}}]}"#,
        ] {
            let chunk: GeminiResponse = serde_json::from_str(raw).unwrap();
            assert_eq!(chunk.text_delta(), None, "raw: {}", raw);
        }
    }

    #[test]
    fn test_usage_metadata_parsed() {
        let chunk: GeminiResponse = serde_json::from_str(
            r#"{"usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":3}}"#,
        )
        .unwrap();
        assert_eq!(chunk.usage(), Some(TokenUsage { input: 12, output: 3 }));
    }

    #[test]
    fn test_default_temperature() {
        assert_eq!(GenerationConfig::default().temperature, DEFAULT_TEMPERATURE);
    }
}
