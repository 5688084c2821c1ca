//! Slack Web API client for the methods the bot listeners call.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::slack_helpers::{
    is_retryable_slack_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlackApiError {
    /// Slack answered `ok: false` with the given `error` code.
    #[error("slack {method} failed: {code}")]
    Api { method: &'static str, code: String },
}

impl SlackApiError {
    pub fn code(&self) -> &str {
        match self {
            Self::Api { code, .. } => code.as_str(),
        }
    }
}

/// True when `error` carries the Slack error code `code`.
pub(crate) fn has_slack_error_code(error: &anyhow::Error, code: &str) -> bool {
    error
        .downcast_ref::<SlackApiError>()
        .is_some_and(|slack_error| slack_error.code() == code)
}

fn ensure_ok(method: &'static str, ok: bool, error: Option<String>) -> Result<()> {
    if ok {
        return Ok(());
    }
    Err(SlackApiError::Api {
        method,
        code: error.unwrap_or_else(|| "unknown_error".to_string()),
    }
    .into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SlackMessageMetadata {
    pub(crate) event_type: String,
    #[serde(default)]
    pub(crate) event_payload: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SlackHistoryMessage {
    #[serde(default)]
    pub(crate) user: Option<String>,
    #[serde(default)]
    pub(crate) bot_id: Option<String>,
    #[serde(default)]
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) ts: Option<String>,
    #[serde(default)]
    pub(crate) metadata: Option<SlackMessageMetadata>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct SlackSuggestedPrompt {
    pub(crate) title: String,
    pub(crate) message: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SlackPostedMessage {
    pub(crate) channel: String,
    pub(crate) ts: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SlackRepliesPage {
    pub(crate) messages: Vec<SlackHistoryMessage>,
    pub(crate) next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOkResponse {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackAuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOpenSocketResponse {
    ok: bool,
    url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackChatMessageResponse {
    ok: bool,
    ts: Option<String>,
    channel: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackConversationMessagesResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<SlackHistoryMessage>,
    #[serde(default)]
    response_metadata: Option<SlackResponseMetadata>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Clone)]
pub(crate) struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
    app_token: String,
    bot_token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl SlackApiClient {
    pub(crate) fn new(
        api_base: String,
        app_token: String,
        bot_token: String,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("kaiwa-slack-bot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create slack api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_token: app_token.trim().to_string(),
            bot_token: bot_token.trim().to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    fn post_bot_json(&self, method: &str, payload: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(self.method_url(method))
            .bearer_auth(&self.bot_token)
            .json(payload)
    }

    pub(crate) async fn resolve_bot_user_id(&self) -> Result<String> {
        let response: SlackAuthTestResponse = self
            .request_json("auth.test", || {
                self.http
                    .post(self.method_url("auth.test"))
                    .bearer_auth(&self.bot_token)
            })
            .await?;
        ensure_ok("auth.test", response.ok, response.error)?;

        response
            .user_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack auth.test did not return user_id"))
    }

    pub(crate) async fn open_socket_connection(&self) -> Result<String> {
        if self.app_token.is_empty() {
            bail!("slack socket mode requires an app-level token (SLACK_APP_TOKEN)");
        }
        let response: SlackOpenSocketResponse = self
            .request_json("apps.connections.open", || {
                self.http
                    .post(self.method_url("apps.connections.open"))
                    .bearer_auth(&self.app_token)
            })
            .await?;
        ensure_ok("apps.connections.open", response.ok, response.error)?;
        response
            .url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack apps.connections.open did not return url"))
    }

    pub(crate) async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
        metadata: Option<&SlackMessageMetadata>,
    ) -> Result<SlackPostedMessage> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts.filter(|value| !value.trim().is_empty()) {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }
        if let Some(metadata) = metadata {
            payload["metadata"] = serde_json::to_value(metadata)?;
        }

        let response: SlackChatMessageResponse = self
            .request_json("chat.postMessage", || {
                self.post_bot_json("chat.postMessage", &payload)
            })
            .await?;
        ensure_ok("chat.postMessage", response.ok, response.error)?;

        Ok(SlackPostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response
                .ts
                .ok_or_else(|| anyhow!("slack chat.postMessage response missing ts"))?,
        })
    }

    pub(crate) async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        metadata: Option<&SlackMessageMetadata>,
    ) -> Result<SlackPostedMessage> {
        let mut payload = json!({
            "channel": channel,
            "ts": ts,
            "text": text,
        });
        if let Some(metadata) = metadata {
            payload["metadata"] = serde_json::to_value(metadata)?;
        }
        let response: SlackChatMessageResponse = self
            .request_json("chat.update", || self.post_bot_json("chat.update", &payload))
            .await?;
        ensure_ok("chat.update", response.ok, response.error)?;
        Ok(SlackPostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response.ts.unwrap_or_else(|| ts.to_string()),
        })
    }

    /// Newest-first channel history, as Slack returns it.
    pub(crate) async fn conversations_history(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<SlackHistoryMessage>> {
        let limit = limit.to_string();
        let response: SlackConversationMessagesResponse = self
            .request_json("conversations.history", || {
                self.http
                    .get(self.method_url("conversations.history"))
                    .bearer_auth(&self.bot_token)
                    .query(&[("channel", channel), ("limit", limit.as_str())])
            })
            .await?;
        ensure_ok("conversations.history", response.ok, response.error)?;
        Ok(response.messages)
    }

    /// One oldest-first page of a thread, starting at `oldest`.
    pub(crate) async fn conversations_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: usize,
        include_all_metadata: bool,
        cursor: Option<&str>,
    ) -> Result<SlackRepliesPage> {
        let mut query = vec![
            ("channel", channel.to_string()),
            ("ts", thread_ts.to_string()),
            ("oldest", thread_ts.to_string()),
            ("limit", limit.to_string()),
        ];
        if include_all_metadata {
            query.push(("include_all_metadata", "true".to_string()));
        }
        if let Some(cursor) = cursor.filter(|value| !value.is_empty()) {
            query.push(("cursor", cursor.to_string()));
        }
        let response: SlackConversationMessagesResponse = self
            .request_json("conversations.replies", || {
                self.http
                    .get(self.method_url("conversations.replies"))
                    .bearer_auth(&self.bot_token)
                    .query(&query)
            })
            .await?;
        ensure_ok("conversations.replies", response.ok, response.error)?;
        Ok(SlackRepliesPage {
            messages: response.messages,
            next_cursor: response
                .response_metadata
                .and_then(|metadata| metadata.next_cursor)
                .filter(|cursor| !cursor.trim().is_empty()),
        })
    }

    pub(crate) async fn conversations_join(&self, channel: &str) -> Result<()> {
        let payload = json!({ "channel": channel });
        let response: SlackOkResponse = self
            .request_json("conversations.join", || {
                self.post_bot_json("conversations.join", &payload)
            })
            .await?;
        ensure_ok("conversations.join", response.ok, response.error)
    }

    pub(crate) async fn set_suggested_prompts(
        &self,
        channel: &str,
        thread_ts: &str,
        prompts: &[SlackSuggestedPrompt],
    ) -> Result<()> {
        let payload = json!({
            "channel_id": channel,
            "thread_ts": thread_ts,
            "prompts": prompts,
        });
        let response: SlackOkResponse = self
            .request_json("assistant.threads.setSuggestedPrompts", || {
                self.post_bot_json("assistant.threads.setSuggestedPrompts", &payload)
            })
            .await?;
        ensure_ok(
            "assistant.threads.setSuggestedPrompts",
            response.ok,
            response.error,
        )
    }

    pub(crate) async fn set_status(
        &self,
        channel: &str,
        thread_ts: &str,
        status: &str,
    ) -> Result<()> {
        let payload = json!({
            "channel_id": channel,
            "thread_ts": thread_ts,
            "status": status,
        });
        let response: SlackOkResponse = self
            .request_json("assistant.threads.setStatus", || {
                self.post_bot_json("assistant.threads.setStatus", &payload)
            })
            .await?;
        ensure_ok("assistant.threads.setStatus", response.ok, response.error)
    }

    async fn request_json<T, F>(&self, operation: &str, mut builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode slack {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_slack_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "slack api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("slack api {operation} request failed"));
                }
            }
        }
    }
}
