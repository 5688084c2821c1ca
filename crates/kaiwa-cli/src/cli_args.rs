use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kaiwa_ai::{DEFAULT_LOCATION, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};

use crate::CliVertexAuthMode;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_temperature(value: &str) -> Result<f32, String> {
    let parsed = value
        .parse::<f32>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || !(0.0..=2.0).contains(&parsed) {
        return Err("value must be a finite number in range 0.0..=2.0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "kaiwa",
    about = "Slack assistant bot backed by Gemini on Vertex AI",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    #[arg(
        long,
        env = "SLACK_BOT_TOKEN",
        hide_env_values = true,
        help = "Bot user OAuth token (xoxb-...)"
    )]
    pub slack_bot_token: Option<String>,

    #[arg(
        long,
        env = "SLACK_SIGNING_SECRET",
        hide_env_values = true,
        help = "Slack app signing secret; required when serving the HTTP Events API"
    )]
    pub slack_signing_secret: Option<String>,

    #[arg(
        long,
        env = "SLACK_APP_TOKEN",
        hide_env_values = true,
        help = "App-level token (xapp-...). When set the bot connects over Socket Mode"
    )]
    pub slack_app_token: Option<String>,

    #[arg(
        long,
        env = "SLACK_BOT_USER_ID",
        help = "Bot user id; resolved with auth.test when omitted"
    )]
    pub slack_bot_user_id: Option<String>,

    #[arg(
        long,
        env = "SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Base URL for the Slack Web API"
    )]
    pub slack_api_base: String,

    #[arg(
        long,
        env = "SLACK_REQUEST_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64,
        help = "Timeout in milliseconds for Slack Web API requests"
    )]
    pub slack_request_timeout_ms: u64,

    #[arg(
        long,
        env = "SLACK_RETRY_MAX_ATTEMPTS",
        default_value_t = 1,
        value_parser = parse_positive_usize,
        help = "Attempts per Slack Web API call on HTTP 429/5xx; 1 disables retries"
    )]
    pub slack_retry_max_attempts: usize,

    #[arg(
        long,
        env = "SLACK_RETRY_BASE_DELAY_MS",
        default_value_t = 500,
        value_parser = parse_positive_u64,
        help = "Base backoff in milliseconds between Slack Web API retries"
    )]
    pub slack_retry_base_delay_ms: u64,

    #[arg(
        long,
        env = "SLACK_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Delay in milliseconds before reopening a dropped Socket Mode connection"
    )]
    pub slack_reconnect_delay_ms: u64,

    #[arg(
        long,
        env = "GCP_PROJECT_ID",
        help = "Google Cloud project that hosts the Vertex AI endpoint"
    )]
    pub gcp_project_id: Option<String>,

    #[arg(
        long,
        env = "VERTEX_AI_LOCATION",
        default_value = DEFAULT_LOCATION,
        help = "Vertex AI region"
    )]
    pub vertex_ai_location: String,

    #[arg(
        long,
        env = "VERTEX_AI_MODEL",
        default_value = DEFAULT_MODEL,
        help = "Gemini publisher model name"
    )]
    pub vertex_ai_model: String,

    #[arg(
        long,
        env = "VERTEX_AI_AUTH_MODE",
        value_enum,
        default_value = "auto",
        help = "Where Vertex AI access tokens come from"
    )]
    pub vertex_ai_auth_mode: CliVertexAuthMode,

    #[arg(
        long,
        env = "VERTEX_AI_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Static OAuth access token for Vertex AI"
    )]
    pub vertex_ai_access_token: Option<String>,

    #[arg(
        long,
        env = "VERTEX_AI_API_BASE",
        help = "Overrides the regional Vertex AI endpoint base URL"
    )]
    pub vertex_ai_api_base: Option<String>,

    #[arg(
        long,
        env = "VERTEX_AI_REQUEST_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Timeout in milliseconds for Vertex AI generation requests"
    )]
    pub vertex_ai_request_timeout_ms: u64,

    #[arg(
        long,
        env = "KAIWA_MAX_OUTPUT_TOKENS",
        default_value_t = DEFAULT_MAX_OUTPUT_TOKENS,
        value_parser = parse_positive_u32,
        help = "Maximum output tokens per generated reply"
    )]
    pub max_output_tokens: u32,

    #[arg(
        long,
        env = "KAIWA_TEMPERATURE",
        default_value_t = DEFAULT_TEMPERATURE,
        value_parser = parse_temperature,
        help = "Sampling temperature for generated replies"
    )]
    pub temperature: f32,

    #[arg(
        long,
        env = "PORT",
        default_value_t = 3000,
        help = "Port for the health endpoint and the HTTP Events API"
    )]
    pub port: u16,

    #[arg(
        long,
        env = "KAIWA_BIND_HOST",
        default_value = "0.0.0.0",
        help = "Interface the HTTP server binds to"
    )]
    pub bind_host: String,

    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        help = "Default log level when RUST_LOG is not set"
    )]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Start the bot (default).
    Run,
    /// Check environment, credentials and required files, then exit.
    ValidateConfig {
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
        #[arg(
            long,
            default_value = ".",
            help = "Directory expected to hold manifest.json"
        )]
        root: PathBuf,
    },
}

impl Cli {
    pub fn command(&self) -> CliCommand {
        self.command.clone().unwrap_or(CliCommand::Run)
    }

    pub fn socket_mode_enabled(&self) -> bool {
        self.slack_app_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}
