//! Fallback-wrapped text generation used by the chat listeners.
//!
//! [`GenerationClient`] never surfaces errors to callers: construction failures
//! leave it permanently unavailable, and per-request failures are logged and
//! replaced by fixed user-facing strings.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    credentials::{resolve_access_token_provider, CredentialProbe, VertexAuthMode},
    vertex::{VertexClient, VertexConfig},
    ChatRequest, KaiwaAiError, LlmClient, Message, MessageRole, SafetySetting,
    StreamDeltaHandler,
};

pub const UNAVAILABLE_REPLY: &str = "Sorry, the AI service is currently unavailable.";
pub const EMPTY_REPLY: &str = "I'm sorry, I couldn't generate a response to that.";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error while processing your request.";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const TOP_P: f32 = 0.95;
pub const TOP_K: u32 = 40;

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub vertex: VertexConfig,
    pub model: String,
    pub auth_mode: VertexAuthMode,
    pub access_token: Option<String>,
    pub probe: CredentialProbe,
}

/// Shared handle over the generation backend, or the lack of one.
#[derive(Clone)]
pub struct GenerationClient {
    backend: Option<Arc<dyn LlmClient>>,
    model: String,
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClient")
            .field("model", &self.model)
            .field("available", &self.is_available())
            .finish()
    }
}

impl GenerationClient {
    pub fn from_vertex_config(config: &GenerationConfig) -> Self {
        match build_vertex_backend(config) {
            Ok(client) => {
                info!(
                    model = %config.model,
                    location = %config.vertex.location,
                    token_source = client.token_source(),
                    "initialized Gemini model"
                );
                Self::with_backend(Arc::new(client), config.model.clone())
            }
            Err(error) => {
                error!(model = %config.model, %error, "failed to initialize Gemini client");
                Self::unavailable(config.model.clone())
            }
        }
    }

    pub fn with_backend(backend: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            backend: Some(backend),
            model: model.into(),
        }
    }

    pub fn unavailable(model: impl Into<String>) -> Self {
        Self {
            backend: None,
            model: model.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate_response(&self, prompt: &str, max_tokens: u32, temperature: f32) -> String {
        self.generate_conversation(&[Message::user(prompt)], None, max_tokens, temperature)
            .await
    }

    /// Sends an ordered multi-turn history, optionally prefixed by a system
    /// instruction.
    pub async fn generate_conversation(
        &self,
        turns: &[Message],
        system_instruction: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> String {
        let Some(backend) = self.backend.as_ref() else {
            return UNAVAILABLE_REPLY.to_string();
        };

        let request = self.build_request(turns, system_instruction, max_tokens, temperature);
        match backend.complete(request).await {
            Ok(response) => {
                let text = response.message.text_content().trim();
                if text.is_empty() {
                    warn!(
                        model = %self.model,
                        finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
                        "empty response from Gemini"
                    );
                    EMPTY_REPLY.to_string()
                } else {
                    text.to_string()
                }
            }
            Err(error) => {
                error!(model = %self.model, %error, "error generating response");
                ERROR_REPLY.to_string()
            }
        }
    }

    /// Hands each non-empty chunk to `on_chunk` as it arrives and returns the
    /// full text. Fallback strings are delivered as a single chunk.
    pub async fn generate_streaming_response(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        on_chunk: StreamDeltaHandler,
    ) -> String {
        let Some(backend) = self.backend.as_ref() else {
            on_chunk(UNAVAILABLE_REPLY.to_string());
            return UNAVAILABLE_REPLY.to_string();
        };

        let request = self.build_request(&[Message::user(prompt)], None, max_tokens, temperature);
        let sink = on_chunk.clone();
        let forward: StreamDeltaHandler = Arc::new(move |chunk: String| {
            if !chunk.is_empty() {
                sink(chunk);
            }
        });
        match backend.complete_with_stream(request, Some(forward)).await {
            Ok(response) => response.message.content,
            Err(error) => {
                error!(model = %self.model, %error, "error generating streaming response");
                on_chunk(ERROR_REPLY.to_string());
                ERROR_REPLY.to_string()
            }
        }
    }

    fn build_request(
        &self,
        turns: &[Message],
        system_instruction: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> ChatRequest {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(system) = system_instruction.filter(|text| !text.trim().is_empty()) {
            messages.push(Message::system(system));
        }
        messages.extend(
            turns
                .iter()
                .filter(|turn| turn.role != MessageRole::System)
                .cloned(),
        );
        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
            top_p: Some(TOP_P),
            top_k: Some(TOP_K),
            safety_settings: SafetySetting::default_set(),
        }
    }
}

fn build_vertex_backend(config: &GenerationConfig) -> Result<VertexClient, KaiwaAiError> {
    if config.model.trim().is_empty() {
        return Err(KaiwaAiError::InvalidConfig("Vertex AI model name"));
    }
    if config.vertex.project_id.trim().is_empty() {
        return Err(KaiwaAiError::MissingProject);
    }
    let token_provider = resolve_access_token_provider(
        config.auth_mode,
        config.access_token.as_deref(),
        &config.probe,
        config.vertex.request_timeout_ms,
    )?;
    VertexClient::new(config.vertex.clone(), token_provider)
}
