use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use kaiwa_ai::{CredentialProbe, GenerationClient, GenerationConfig, VertexConfig};
use kaiwa_cli::{Cli, CliCommand};
use kaiwa_diagnostics::{
    has_failures, render_doctor_report, render_doctor_report_json, run_config_checks_with_lookup,
    ConfigValidationConfig,
};
use kaiwa_slack::{run_socket_mode, slack_events_router, SlackBridge, SlackBridgeRuntimeConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::{build_health_router, serve_http};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command() {
        CliCommand::ValidateConfig { json, root } => run_validate_config(&cli, json, &root),
        CliCommand::Run => run_bot(cli).await,
    }
}

fn run_validate_config(cli: &Cli, json: bool, root: &Path) -> Result<()> {
    let checks = run_config_checks_with_lookup(
        &ConfigValidationConfig {
            root_dir: root.to_path_buf(),
            auth_mode: cli.vertex_ai_auth_mode.into(),
            probe: CredentialProbe::from_env(),
        },
        cli_config_lookup(cli),
    );
    if json {
        println!("{}", render_doctor_report_json(&checks));
    } else {
        println!("{}", render_doctor_report(&checks));
    }
    if has_failures(&checks) {
        bail!("configuration validation failed");
    }
    Ok(())
}

/// Flag values win over the process environment; settings without a flag,
/// or whose flag only carries a default, are read from the environment.
fn cli_config_lookup(cli: &Cli) -> impl Fn(&str) -> Option<String> + '_ {
    move |name: &str| {
        let parsed = match name {
            "SLACK_BOT_TOKEN" => cli.slack_bot_token.clone(),
            "SLACK_SIGNING_SECRET" => cli.slack_signing_secret.clone(),
            "SLACK_APP_TOKEN" => cli.slack_app_token.clone(),
            "GCP_PROJECT_ID" => cli.gcp_project_id.clone(),
            "VERTEX_AI_ACCESS_TOKEN" => cli.vertex_ai_access_token.clone(),
            _ => None,
        };
        parsed.or_else(|| std::env::var(name).ok())
    }
}

async fn run_bot(cli: Cli) -> Result<()> {
    let socket_mode = cli.socket_mode_enabled();
    let signing_secret = if socket_mode {
        None
    } else {
        Some(require_non_empty(
            cli.slack_signing_secret.as_deref(),
            "SLACK_SIGNING_SECRET",
        )?)
    };
    let bind_addr = resolve_bind_addr(&cli)?;

    let generation = Arc::new(build_generation_client(&cli));
    if !generation.is_available() {
        warn!("Gemini client is unavailable; check the Google Cloud configuration");
    }
    let bridge = SlackBridge::new(build_bridge_config(&cli, generation.clone())?).await?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind http server on {bind_addr}"))?;
    let health = build_health_router(generation);

    match signing_secret {
        None => {
            info!("starting slack app in socket mode");
            let health_server = tokio::spawn(serve_http(listener, health));
            let result = run_socket_mode(bridge).await;
            health_server.abort();
            result
        }
        Some(secret) => {
            info!(port = cli.port, "starting slack app with the http events api");
            serve_http(listener, health.merge(slack_events_router(bridge, secret))).await
        }
    }
}

fn require_non_empty(value: Option<&str>, name: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{name} is required"))
}

fn resolve_bind_addr(cli: &Cli) -> Result<SocketAddr> {
    let raw = format!("{}:{}", cli.bind_host.trim(), cli.port);
    raw.parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{raw}': expected host:port"))
}

fn build_generation_client(cli: &Cli) -> GenerationClient {
    GenerationClient::from_vertex_config(&GenerationConfig {
        vertex: VertexConfig {
            api_base: cli.vertex_ai_api_base.clone(),
            project_id: cli.gcp_project_id.clone().unwrap_or_default(),
            location: cli.vertex_ai_location.clone(),
            request_timeout_ms: cli.vertex_ai_request_timeout_ms,
        },
        model: cli.vertex_ai_model.clone(),
        auth_mode: cli.vertex_ai_auth_mode.into(),
        access_token: cli.vertex_ai_access_token.clone(),
        probe: CredentialProbe::from_env(),
    })
}

pub(crate) fn build_bridge_config(
    cli: &Cli,
    generation: Arc<GenerationClient>,
) -> Result<SlackBridgeRuntimeConfig> {
    Ok(SlackBridgeRuntimeConfig {
        generation,
        max_output_tokens: cli.max_output_tokens,
        temperature: cli.temperature,
        api_base: cli.slack_api_base.clone(),
        app_token: cli.slack_app_token.clone(),
        bot_token: require_non_empty(cli.slack_bot_token.as_deref(), "SLACK_BOT_TOKEN")?,
        bot_user_id: cli.slack_bot_user_id.clone(),
        request_timeout_ms: cli.slack_request_timeout_ms,
        reconnect_delay: Duration::from_millis(cli.slack_reconnect_delay_ms),
        retry_max_attempts: cli.slack_retry_max_attempts,
        retry_base_delay_ms: cli.slack_retry_base_delay_ms,
    })
}
