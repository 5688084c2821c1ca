//! Gemini on Vertex AI: request types, transport, credentials and the
//! fallback-wrapped generation handle used by the Slack runtime.
mod credentials;
mod generation;
mod types;
mod vertex;

pub use credentials::{
    describe_credential_source, is_executable_available, resolve_access_token_provider,
    AccessTokenProvider, CredentialProbe, GcloudCliTokenProvider, MetadataServerTokenProvider,
    ServiceAccountKey, ServiceAccountTokenProvider, StaticAccessToken, VertexAuthMode,
    CLOUD_PLATFORM_SCOPE, DEFAULT_METADATA_HOST, DEFAULT_TOKEN_URI,
};
pub use generation::{
    GenerationClient, GenerationConfig, DEFAULT_LOCATION, DEFAULT_MAX_OUTPUT_TOKENS,
    DEFAULT_MODEL, DEFAULT_TEMPERATURE, EMPTY_REPLY, ERROR_REPLY, TOP_K, TOP_P,
    UNAVAILABLE_REPLY,
};
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, HarmBlockThreshold, HarmCategory, KaiwaAiError,
    LlmClient, Message, MessageRole, SafetySetting, StreamDeltaHandler,
};
pub use vertex::{default_vertex_api_base, VertexClient, VertexConfig};
