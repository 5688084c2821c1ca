//! Slack bot runtime: event dispatch, Socket Mode transport and reply helpers.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use kaiwa_ai::{GenerationClient, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

mod assistant;
mod http_events;
mod message_listeners;
mod slack_api_client;
mod slack_events;
mod thread_context;

pub use http_events::{slack_events_router, verify_slack_signature, SLACK_EVENTS_PATH};
pub use slack_api_client::SlackApiError;

use slack_api_client::SlackApiClient;
use slack_events::{normalize_event_callback, SlackInboundEvent, SlackMessageEvent};

#[derive(Clone)]
/// Runtime configuration shared by both Slack transports.
pub struct SlackBridgeRuntimeConfig {
    pub generation: Arc<GenerationClient>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub api_base: String,
    pub app_token: Option<String>,
    pub bot_token: String,
    pub bot_user_id: Option<String>,
    pub request_timeout_ms: u64,
    pub reconnect_delay: Duration,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

/// Shared, read-only state handed to every listener invocation.
pub struct SlackBridge {
    slack_client: SlackApiClient,
    generation: Arc<GenerationClient>,
    bot_user_id: String,
    max_output_tokens: u32,
    temperature: f32,
    reconnect_delay: Duration,
}

impl SlackBridge {
    pub async fn new(config: SlackBridgeRuntimeConfig) -> Result<Arc<Self>> {
        let slack_client = SlackApiClient::new(
            config.api_base.clone(),
            config.app_token.clone().unwrap_or_default(),
            config.bot_token.clone(),
            config.request_timeout_ms,
            config.retry_max_attempts,
            config.retry_base_delay_ms,
        )?;

        let bot_user_id = match config.bot_user_id.clone() {
            Some(user_id) if !user_id.trim().is_empty() => user_id.trim().to_string(),
            _ => slack_client
                .resolve_bot_user_id()
                .await
                .context("failed to resolve slack bot user id")?,
        };
        info!(bot_user_id = %bot_user_id, "slack bot identity resolved");

        Ok(Arc::new(Self {
            slack_client,
            generation: config.generation,
            bot_user_id,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            reconnect_delay: config.reconnect_delay,
        }))
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    pub fn generation_available(&self) -> bool {
        self.generation.is_available()
    }

    /// Runs the listener for `event` on its own task.
    pub(crate) fn dispatch(self: &Arc<Self>, event: SlackInboundEvent) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.handle_event(event).await })
    }

    pub(crate) async fn handle_event(&self, event: SlackInboundEvent) {
        let event_type = event.kind();
        debug!(event_type, event_id = event.event_id(), "handling slack event");
        let result = match &event {
            SlackInboundEvent::AppMention(message) => {
                message_listeners::handle_app_mention(self, message).await
            }
            SlackInboundEvent::Message(message) => self.route_message(message).await,
            SlackInboundEvent::AssistantThreadStarted(thread) => {
                assistant::start_assistant_thread(self, thread).await
            }
            SlackInboundEvent::AssistantThreadContextChanged(thread) => {
                assistant::update_thread_context(self, thread).await
            }
        };

        let Err(listener_error) = result else {
            return;
        };
        let (channel, thread_ts) = error_reply_target(&event);
        error!(
            event_type,
            event_id = event.event_id(),
            channel,
            thread_ts = thread_ts.unwrap_or_default(),
            error = %format!("{listener_error:#}"),
            "slack listener failed"
        );
        let warning = format!(":warning: Something went wrong! ({listener_error})");
        if let Err(post_error) = self.say(channel, thread_ts, &warning).await {
            warn!(channel, error = %post_error, "failed to post listener failure notice");
        }
    }

    async fn route_message(&self, message: &SlackMessageEvent) -> Result<()> {
        if message.is_assistant_thread_message() {
            return assistant::respond_in_assistant_thread(self, message).await;
        }
        if let Some(keyword) = message_listeners::match_keyword(&message.text) {
            return message_listeners::handle_keyword(self, message, keyword).await;
        }
        if message.is_direct_message() {
            return message_listeners::handle_direct_message(self, message).await;
        }
        Ok(())
    }

    pub(crate) async fn say(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<()> {
        let posted = self
            .slack_client
            .post_message(channel, text, thread_ts, None)
            .await?;
        debug!(channel = %posted.channel, ts = %posted.ts, "slack reply posted");
        Ok(())
    }

    pub(crate) async fn generate(&self, prompt: &str) -> String {
        self.generation
            .generate_response(prompt, self.max_output_tokens, self.temperature)
            .await
    }

    pub(crate) async fn generate_conversation(
        &self,
        turns: &[Message],
        system_instruction: Option<&str>,
    ) -> String {
        self.generation
            .generate_conversation(
                turns,
                system_instruction,
                self.max_output_tokens,
                self.temperature,
            )
            .await
    }
}

fn error_reply_target(event: &SlackInboundEvent) -> (&str, Option<&str>) {
    match event {
        SlackInboundEvent::AppMention(message) => (
            message.channel.as_str(),
            Some(message.thread_ts.as_deref().unwrap_or(message.ts.as_str())),
        ),
        SlackInboundEvent::Message(message) => {
            (message.channel.as_str(), message.thread_ts.as_deref())
        }
        SlackInboundEvent::AssistantThreadStarted(thread)
        | SlackInboundEvent::AssistantThreadContextChanged(thread) => {
            (thread.channel.as_str(), Some(thread.thread_ts.as_str()))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SlackSocketEnvelope {
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketSessionEnd {
    Shutdown,
    Reconnect,
}

/// Connects over Socket Mode and serves events until Ctrl-C, reconnecting
/// after `reconnect_delay` whenever the socket drops.
pub async fn run_socket_mode(bridge: Arc<SlackBridge>) -> Result<()> {
    loop {
        let socket_url = match bridge.slack_client.open_socket_connection().await {
            Ok(url) => url,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to open slack socket connection");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("slack socket mode shutdown requested");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(bridge.reconnect_delay) => {}
                }
                continue;
            }
        };

        info!("slack socket mode connected");
        match run_socket_session(&bridge, &socket_url).await {
            Ok(SocketSessionEnd::Shutdown) => {
                info!("slack socket mode shutdown requested");
                return Ok(());
            }
            Ok(SocketSessionEnd::Reconnect) => {
                info!("slack socket session ended; reconnecting");
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "slack socket session error");
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("slack socket mode shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(bridge.reconnect_delay) => {}
        }
    }
}

async fn run_socket_session(
    bridge: &Arc<SlackBridge>,
    socket_url: &str,
) -> Result<SocketSessionEnd> {
    let (stream, _response) = connect_async(socket_url)
        .await
        .with_context(|| "failed to connect slack socket mode websocket")?;
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                return Ok(SocketSessionEnd::Shutdown);
            }
            maybe_message = source.next() => {
                let Some(message_result) = maybe_message else {
                    return Ok(SocketSessionEnd::Reconnect);
                };
                let message = message_result.context("failed reading slack websocket message")?;
                if matches!(message, WsMessage::Close(_)) {
                    return Ok(SocketSessionEnd::Reconnect);
                }
                let Some(envelope) = parse_socket_envelope(message)? else {
                    continue;
                };
                if let Some(envelope_id) = envelope.envelope_id.as_deref() {
                    ack_envelope(&mut sink, envelope_id).await?;
                }
                if handle_socket_envelope(bridge, envelope) {
                    return Ok(SocketSessionEnd::Reconnect);
                }
            }
        }
    }
}

async fn ack_envelope<S>(sink: &mut S, envelope_id: &str) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    sink.send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send slack socket ack")
}

/// Dispatches an acked envelope. Returns true when Slack asked for a reconnect.
fn handle_socket_envelope(bridge: &Arc<SlackBridge>, envelope: SlackSocketEnvelope) -> bool {
    match envelope.envelope_type.as_str() {
        "hello" => {
            debug!("slack socket mode hello received");
        }
        "disconnect" => {
            info!(
                reason = envelope.reason.as_deref().unwrap_or("unspecified"),
                "slack requested socket disconnect"
            );
            return true;
        }
        "events_api" => {
            match normalize_event_callback(&envelope.payload, &bridge.bot_user_id) {
                Ok(Some(event)) => {
                    bridge.dispatch(event);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "dropping malformed slack event");
                }
            }
        }
        other => {
            debug!(envelope_type = other, "ignoring slack socket envelope");
        }
    }
    false
}

fn parse_socket_envelope(message: WsMessage) -> Result<Option<SlackSocketEnvelope>> {
    match message {
        WsMessage::Text(text) => {
            let envelope = serde_json::from_str::<SlackSocketEnvelope>(&text)
                .context("failed to parse slack socket envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).context("invalid utf-8 slack socket payload")?;
            let envelope = serde_json::from_str::<SlackSocketEnvelope>(&text)
                .context("failed to parse slack socket envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) => Ok(None),
        WsMessage::Close(_) => Ok(None),
        WsMessage::Frame(_) => Ok(None),
    }
}
