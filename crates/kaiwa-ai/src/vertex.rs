use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    credentials::AccessTokenProvider, ChatRequest, ChatResponse, ChatUsage, KaiwaAiError,
    LlmClient, Message, MessageRole, StreamDeltaHandler,
};

#[derive(Debug, Clone)]
pub struct VertexConfig {
    /// Overrides the regional `https://{location}-aiplatform.googleapis.com/v1` base.
    pub api_base: Option<String>,
    pub project_id: String,
    pub location: String,
    pub request_timeout_ms: u64,
}

/// Gemini `generateContent` client for the Vertex AI publisher-model endpoint.
#[derive(Clone)]
pub struct VertexClient {
    client: reqwest::Client,
    models_base: String,
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for VertexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexClient")
            .field("models_base", &self.models_base)
            .field("token_source", &self.token_provider.source_name())
            .finish()
    }
}

pub fn default_vertex_api_base(location: &str) -> String {
    let location = location.trim();
    if location == "global" {
        "https://aiplatform.googleapis.com/v1".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com/v1")
    }
}

impl VertexClient {
    pub fn new(
        config: VertexConfig,
        token_provider: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self, KaiwaAiError> {
        let project_id = config.project_id.trim();
        if project_id.is_empty() {
            return Err(KaiwaAiError::MissingProject);
        }
        let location = config.location.trim();
        if location.is_empty() {
            return Err(KaiwaAiError::InvalidConfig("Vertex AI location"));
        }

        let base = config
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_vertex_api_base(location));
        let models_base = format!(
            "{}/projects/{project_id}/locations/{location}/publishers/google/models",
            base.trim_end_matches('/')
        );

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self {
            client,
            models_base,
            token_provider,
        })
    }

    fn generate_content_url(&self, model: &str) -> String {
        format!("{}/{model}:generateContent", self.models_base)
    }

    fn stream_generate_content_url(&self, model: &str) -> String {
        format!("{}/{model}:streamGenerateContent", self.models_base)
    }

    pub fn token_source(&self) -> &'static str {
        self.token_provider.source_name()
    }
}

#[async_trait]
impl LlmClient for VertexClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, KaiwaAiError> {
        self.complete_with_mode(request, None).await
    }

    async fn complete_with_stream(
        &self,
        request: ChatRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<ChatResponse, KaiwaAiError> {
        self.complete_with_mode(request, on_delta).await
    }
}

impl VertexClient {
    async fn complete_with_mode(
        &self,
        request: ChatRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<ChatResponse, KaiwaAiError> {
        if request.model.trim().is_empty() {
            return Err(KaiwaAiError::InvalidConfig("Vertex AI model name"));
        }
        let body = build_generate_content_body(&request);
        let url = if on_delta.is_some() {
            self.stream_generate_content_url(&request.model)
        } else {
            self.generate_content_url(&request.model)
        };
        let token = self.token_provider.access_token().await?;

        let mut builder = self.client.post(&url).bearer_auth(token).json(&body);
        if on_delta.is_some() {
            builder = builder.query(&[("alt", "sse")]);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await?;
            return Err(KaiwaAiError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }

        let Some(delta_handler) = on_delta else {
            let raw = response.text().await?;
            return parse_generate_content_response(&raw);
        };

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false);
        if is_event_stream {
            return parse_generate_content_stream_response(response, delta_handler).await;
        }

        let raw = response.text().await?;
        let parsed = parse_generate_content_response(&raw)?;
        let text = parsed.message.text_content();
        if !text.is_empty() {
            delta_handler(text.to_string());
        }
        Ok(parsed)
    }
}

fn build_generate_content_body(request: &ChatRequest) -> Value {
    let system = extract_system_text(&request.messages);
    let contents = to_vertex_contents(&request.messages);

    let mut body = json!({
        "contents": contents,
    });

    if !system.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": system }],
        });
    }

    let mut generation_config = json!({});
    if let Some(max_tokens) = request.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        generation_config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        generation_config["topP"] = json!(top_p);
    }
    if let Some(top_k) = request.top_k {
        generation_config["topK"] = json!(top_k);
    }
    body["generationConfig"] = generation_config;

    if !request.safety_settings.is_empty() {
        body["safetySettings"] = json!(request.safety_settings);
    }

    body
}

fn extract_system_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(Message::text_content)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn to_vertex_contents(messages: &[Message]) -> Value {
    Value::Array(
        messages
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .filter_map(|message| {
                let role = match message.role {
                    MessageRole::System => return None,
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                };
                Some(json!({
                    "role": role,
                    "parts": [{ "text": message.content }],
                }))
            })
            .collect(),
    )
}

fn parse_generate_content_response(raw: &str) -> Result<ChatResponse, KaiwaAiError> {
    let parsed: GenerateContentResponse = serde_json::from_str(raw)?;
    let candidate = parsed
        .candidates
        .and_then(|mut candidates| candidates.drain(..).next())
        .ok_or_else(|| {
            let reason = parsed
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .map(|reason| format!(" (prompt blocked: {reason})"))
                .unwrap_or_default();
            KaiwaAiError::InvalidResponse(format!("response contained no candidates{reason}"))
        })?;

    let text = candidate
        .content
        .and_then(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<String>();

    let usage = parsed
        .usage_metadata
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_text(text),
        finish_reason: candidate.finish_reason,
        usage,
    })
}

/// Buffers raw stream bytes; only complete lines are decoded as UTF-8.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, KaiwaAiError> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=pos).collect::<Vec<_>>();
            lines.push(decode_stream_line(&line[..pos])?);
        }
        Ok(lines)
    }

    fn finish(self) -> Result<Option<String>, KaiwaAiError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        decode_stream_line(&self.pending).map(Some)
    }
}

fn decode_stream_line(bytes: &[u8]) -> Result<String, KaiwaAiError> {
    std::str::from_utf8(bytes)
        .map(|line| line.trim().to_string())
        .map_err(|error| {
            KaiwaAiError::InvalidResponse(format!("invalid UTF-8 in Vertex stream response: {error}"))
        })
}

async fn parse_generate_content_stream_response(
    response: reqwest::Response,
    on_delta: StreamDeltaHandler,
) -> Result<ChatResponse, KaiwaAiError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();
    let mut text = String::new();
    let mut finish_reason = None;
    let mut usage = ChatUsage::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in buffer.push(chunk.as_ref())? {
            if let Some(data) = line.strip_prefix("data:") {
                apply_stream_data(
                    data.trim(),
                    &on_delta,
                    &mut text,
                    &mut finish_reason,
                    &mut usage,
                )?;
            }
        }
    }

    if let Some(line) = buffer.finish()? {
        if let Some(data) = line.strip_prefix("data:") {
            apply_stream_data(
                data.trim(),
                &on_delta,
                &mut text,
                &mut finish_reason,
                &mut usage,
            )?;
        }
    }

    Ok(ChatResponse {
        message: Message::assistant_text(text),
        finish_reason,
        usage,
    })
}

fn apply_stream_data(
    data: &str,
    on_delta: &StreamDeltaHandler,
    text: &mut String,
    finish_reason: &mut Option<String>,
    usage: &mut ChatUsage,
) -> Result<(), KaiwaAiError> {
    if data.is_empty() {
        return Ok(());
    }

    let chunk: GenerateContentResponse = serde_json::from_str(data).map_err(|error| {
        KaiwaAiError::InvalidResponse(format!("failed to parse Vertex stream chunk: {error}"))
    })?;
    if let Some(chunk_usage) = chunk.usage_metadata {
        usage.input_tokens = chunk_usage.prompt_token_count.unwrap_or(usage.input_tokens);
        usage.output_tokens = chunk_usage
            .candidates_token_count
            .unwrap_or(usage.output_tokens);
        usage.total_tokens = chunk_usage.total_token_count.unwrap_or(usage.total_tokens);
    }

    for candidate in chunk.candidates.unwrap_or_default() {
        if let Some(reason) = candidate.finish_reason {
            *finish_reason = Some(reason);
        }
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for delta_text in parts.into_iter().filter_map(|part| part.text) {
            if !delta_text.is_empty() {
                text.push_str(&delta_text);
                on_delta(delta_text);
            }
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<GenerateContentCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GenerateContentUsage>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentCandidate {
    content: Option<GenerateContentContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentContent {
    parts: Option<Vec<GenerateContentPart>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{
        apply_stream_data, build_generate_content_body, default_vertex_api_base,
        parse_generate_content_response, SseLineBuffer, VertexClient, VertexConfig,
    };
    use crate::{
        credentials::StaticAccessToken, ChatRequest, ChatUsage, KaiwaAiError, Message,
        SafetySetting,
    };

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "gemini-2.5-flash".to_string(),
            messages,
            max_tokens: Some(1024),
            temperature: Some(0.7),
            top_p: Some(0.95),
            top_k: Some(40),
            safety_settings: SafetySetting::default_set(),
        }
    }

    fn config(project_id: &str, location: &str) -> VertexConfig {
        VertexConfig {
            api_base: None,
            project_id: project_id.to_string(),
            location: location.to_string(),
            request_timeout_ms: 1_000,
        }
    }

    #[test]
    fn unit_default_api_base_uses_regional_host() {
        assert_eq!(
            default_vertex_api_base("us-central1"),
            "https://us-central1-aiplatform.googleapis.com/v1"
        );
        assert_eq!(
            default_vertex_api_base("global"),
            "https://aiplatform.googleapis.com/v1"
        );
    }

    #[test]
    fn regression_new_rejects_blank_project_and_location() {
        let token = Arc::new(StaticAccessToken::new("tok").expect("token"));
        let error = VertexClient::new(config(" ", "us-central1"), token.clone())
            .expect_err("blank project");
        assert!(matches!(error, KaiwaAiError::MissingProject));
        let error = VertexClient::new(config("proj", ""), token).expect_err("blank location");
        assert!(matches!(error, KaiwaAiError::InvalidConfig(_)));
    }

    #[test]
    fn unit_generate_content_url_targets_publisher_model() {
        let token = Arc::new(StaticAccessToken::new("tok").expect("token"));
        let client = VertexClient::new(config("proj", "europe-west4"), token).expect("client");
        assert_eq!(
            client.generate_content_url("gemini-2.5-flash"),
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/proj/locations/europe-west4/publishers/google/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn functional_body_carries_generation_config_and_safety_settings() {
        let body = build_generate_content_body(&request(vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant_text("hello"),
            Message::user("how are you"),
        ]));

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "how are you");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(body["generationConfig"]["topK"], 40);
        let top_p = body["generationConfig"]["topP"]
            .as_f64()
            .expect("topP should serialize as f64");
        assert!((top_p - 0.95).abs() < 1e-6);
        assert_eq!(body["safetySettings"].as_array().map(Vec::len), Some(4));
        assert_eq!(
            body["safetySettings"][0]["category"],
            "HARM_CATEGORY_HATE_SPEECH"
        );
        assert_eq!(
            body["safetySettings"][3]["threshold"],
            "BLOCK_MEDIUM_AND_ABOVE"
        );
    }

    #[test]
    fn functional_parses_text_parts_and_usage() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        }"#;

        let response = parse_generate_content_response(raw).expect("response must parse");
        assert_eq!(response.message.text_content(), "Hello");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.total_tokens, 5);
    }

    #[test]
    fn regression_blocked_prompt_without_candidates_is_invalid_response() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let error = parse_generate_content_response(raw).expect_err("no candidates");
        assert!(matches!(error, KaiwaAiError::InvalidResponse(_)));
        assert!(error.to_string().contains("SAFETY"));
    }

    #[test]
    fn functional_stream_data_accumulates_text_and_usage() {
        let streamed = Arc::new(Mutex::new(Vec::new()));
        let sink_streamed = streamed.clone();
        let sink: crate::StreamDeltaHandler = Arc::new(move |delta: String| {
            sink_streamed.lock().expect("stream lock").push(delta);
        });

        let mut text = String::new();
        let mut finish_reason = None;
        let mut usage = ChatUsage::default();
        apply_stream_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
            &sink,
            &mut text,
            &mut finish_reason,
            &mut usage,
        )
        .expect("first chunk parses");
        apply_stream_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":9}}"#,
            &sink,
            &mut text,
            &mut finish_reason,
            &mut usage,
        )
        .expect("second chunk parses");

        assert_eq!(text, "Hello");
        assert_eq!(
            streamed.lock().expect("stream lock").as_slice(),
            ["Hel".to_string(), "lo".to_string()]
        );
        assert_eq!(finish_reason.as_deref(), Some("STOP"));
        assert_eq!(usage.total_tokens, 9);
    }

    #[test]
    fn regression_line_buffer_joins_multibyte_character_split_across_chunks() {
        let line = "data: {\"text\":\"café\"}\n".as_bytes();
        let split = line.iter().position(|byte| *byte == 0xC3).expect("lead byte") + 1;

        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(&line[..split]).expect("first half").is_empty());
        let lines = buffer.push(&line[split..]).expect("second half");
        assert_eq!(lines, vec![r#"data: {"text":"café"}"#.to_string()]);
        assert_eq!(buffer.finish().expect("finish"), None);
    }

    #[test]
    fn unit_line_buffer_returns_unterminated_tail_on_finish() {
        let mut buffer = SseLineBuffer::default();
        let lines = buffer.push(b"data: one\r\ndata: two").expect("push");
        assert_eq!(lines, vec!["data: one".to_string()]);
        assert_eq!(
            buffer.finish().expect("finish").as_deref(),
            Some("data: two")
        );
    }

    #[test]
    fn regression_line_buffer_rejects_invalid_utf8_lines() {
        let mut buffer = SseLineBuffer::default();
        let error = buffer.push(b"data: \xFF\n").expect_err("invalid utf-8");
        assert!(error.to_string().contains("invalid UTF-8"));
    }

    #[test]
    fn regression_stream_data_surfaces_parse_errors() {
        let sink: crate::StreamDeltaHandler = Arc::new(|_delta: String| {});
        let mut text = String::new();
        let mut finish_reason = None;
        let mut usage = ChatUsage::default();

        let error = apply_stream_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}"#,
            &sink,
            &mut text,
            &mut finish_reason,
            &mut usage,
        )
        .expect_err("invalid stream payload should fail");
        assert!(error.to_string().contains("failed to parse Vertex stream chunk"));
    }
}
