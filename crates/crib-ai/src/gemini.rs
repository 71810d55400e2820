//! Client for the Gemini generation endpoint

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};

use crate::error::{Error, Result};
use crate::stream::{StreamEvent, StreamEventStream};
use crate::types::{GeminiErrorBody, GeminiRequest, GeminiResponse, GenerateRequest, GenerationConfig, TokenUsage};

/// Default API endpoint
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Probe sent by the key check; the model must echo `OK`
const KEY_CHECK_PROMPT: &str = "You are a connectivity probe. Reply with exactly: OK";
const KEY_CHECK_CONTENT: &str = "Connectivity check.";

/// Client for streaming and one-shot generation requests
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    /// Create a client with an explicit API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client from GEMINI_API_KEY or GOOGLE_API_KEY
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Override the endpoint base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Stream a generation request.
    ///
    /// Network and HTTP failures surface as a terminal `Error` event on
    /// the returned stream, not as an `Err` from this call. A stream
    /// whose concatenated text is only whitespace also ends in `Error`.
    pub async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<StreamEventStream> {
        let body = GeminiRequest::from_request(request);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );

        let request_builder = self.client.post(&url).json(&body);
        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }

    /// One-shot generation against the non-streaming endpoint
    pub async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<String> {
        let body = GeminiRequest::from_request(request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), &body));
        }

        let parsed: GeminiResponse = response.json().await?;
        let text = parsed.text_delta().unwrap_or_default();
        if text.trim().is_empty() {
            return Err(Error::EmptyResponse);
        }
        Ok(text)
    }

    /// Validate the configured key with a minimal probe request
    pub async fn check_key(&self, model: &str) -> Result<()> {
        let request = GenerateRequest {
            system_prompt: KEY_CHECK_PROMPT.to_string(),
            user_content: KEY_CHECK_CONTENT.to_string(),
            config: GenerationConfig { temperature: 0.0 },
        };
        let reply = self.generate(model, &request).await?;
        if reply.trim() == "OK" {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse(reply.trim().to_string()))
        }
    }
}

/// Map a non-2xx response body to an error, preferring the provider's
/// own message when the body parses
fn error_for_status(status: u16, body: &str) -> Error {
    match serde_json::from_str::<GeminiErrorBody>(body) {
        Ok(parsed) if !parsed.error.message.is_empty() => Error::api(status, parsed.error.message),
        _ => Error::status(status),
    }
}

/// Drive the event source to completion, yielding chunk events and a
/// single terminal event.
///
/// The SSE layer signals normal end-of-stream as `StreamEnded`; the
/// source is closed on the first terminal condition so it never
/// auto-reconnects.
fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = StreamEvent> {
    stream! {
        let mut accumulated = String::new();
        let mut usage = TokenUsage::default();

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data.is_empty() || msg.data == "[DONE]" {
                        continue;
                    }
                    let chunk: GeminiResponse = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::trace!("skipping unparseable SSE line: {}", e);
                            continue;
                        }
                    };
                    if let Some(u) = chunk.usage() {
                        usage = u;
                    }
                    if let Some(delta) = chunk.text_delta() {
                        accumulated.push_str(&delta);
                        yield StreamEvent::Chunk { delta };
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let body = response.text().await.unwrap_or_default();
                    event_source.close();
                    yield StreamEvent::Error {
                        message: error_for_status(status.as_u16(), &body).to_string(),
                    };
                    return;
                }
                Err(e) => {
                    event_source.close();
                    yield StreamEvent::Error { message: e.to_string() };
                    return;
                }
            }
        }
        event_source.close();

        if accumulated.trim().is_empty() {
            yield StreamEvent::Error {
                message: Error::EmptyResponse.to_string(),
            };
        } else {
            yield StreamEvent::Done {
                text: accumulated,
                usage,
            };
        }
    }
}
