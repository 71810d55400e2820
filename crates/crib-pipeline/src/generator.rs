//! The seam between the pipeline and the generation client

use async_trait::async_trait;

use crib_ai::{GeminiClient, GenerateRequest, StreamEventStream};

/// Issues one generation request and streams its events.
///
/// The pipeline talks to the model through this trait so tests can
/// substitute deterministic generators.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> crib_ai::Result<StreamEventStream>;
}

/// Production generator backed by the Gemini client
pub struct GeminiGenerator {
    client: GeminiClient,
}

impl GeminiGenerator {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> crib_ai::Result<StreamEventStream> {
        self.client.stream_generate(model, request).await
    }
}
