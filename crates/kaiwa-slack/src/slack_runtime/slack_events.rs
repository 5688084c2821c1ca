//! Inbound Slack event payloads, shared by Socket Mode and the HTTP Events API.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::thread_context::AssistantThreadContext;

#[derive(Debug, Deserialize)]
struct SlackEventCallbackEnvelope {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event: Option<SlackEventPayload>,
}

#[derive(Debug, Deserialize)]
struct SlackEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    assistant_thread: Option<SlackAssistantThread>,
}

#[derive(Debug, Deserialize)]
struct SlackAssistantThread {
    #[serde(default)]
    user_id: Option<String>,
    channel_id: String,
    thread_ts: String,
    #[serde(default)]
    context: AssistantThreadContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlackMessageEvent {
    pub(crate) event_id: String,
    pub(crate) channel: String,
    pub(crate) channel_type: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) text: String,
    pub(crate) ts: String,
    pub(crate) thread_ts: Option<String>,
}

impl SlackMessageEvent {
    pub(crate) fn is_direct_message(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }

    /// A threaded reply in a DM, which is how assistant-container messages arrive.
    pub(crate) fn is_assistant_thread_message(&self) -> bool {
        self.is_direct_message()
            && self
                .thread_ts
                .as_deref()
                .is_some_and(|thread_ts| !thread_ts.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlackAssistantThreadEvent {
    pub(crate) event_id: String,
    pub(crate) user: Option<String>,
    pub(crate) channel: String,
    pub(crate) thread_ts: String,
    pub(crate) context: AssistantThreadContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlackInboundEvent {
    AppMention(SlackMessageEvent),
    Message(SlackMessageEvent),
    AssistantThreadStarted(SlackAssistantThreadEvent),
    AssistantThreadContextChanged(SlackAssistantThreadEvent),
}

impl SlackInboundEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::AppMention(_) => "app_mention",
            Self::Message(_) => "message",
            Self::AssistantThreadStarted(_) => "assistant_thread_started",
            Self::AssistantThreadContextChanged(_) => "assistant_thread_context_changed",
        }
    }

    pub(crate) fn event_id(&self) -> &str {
        match self {
            Self::AppMention(event) | Self::Message(event) => &event.event_id,
            Self::AssistantThreadStarted(event) | Self::AssistantThreadContextChanged(event) => {
                &event.event_id
            }
        }
    }
}

/// Maps an `event_callback` body to a listener event. Returns `None` for
/// callbacks no listener handles, bot-authored messages and edits.
pub(crate) fn normalize_event_callback(
    payload: &Value,
    bot_user_id: &str,
) -> Result<Option<SlackInboundEvent>> {
    let callback = serde_json::from_value::<SlackEventCallbackEnvelope>(payload.clone())
        .context("failed to decode slack event callback payload")?;
    if callback.callback_type != "event_callback" {
        return Ok(None);
    }
    let Some(event) = callback.event else {
        return Ok(None);
    };
    let event_id = callback.event_id.unwrap_or_default();

    match event.event_type.as_str() {
        "assistant_thread_started" | "assistant_thread_context_changed" => {
            let Some(thread) = event.assistant_thread else {
                return Ok(None);
            };
            let thread_event = SlackAssistantThreadEvent {
                event_id,
                user: thread.user_id,
                channel: thread.channel_id,
                thread_ts: thread.thread_ts,
                context: thread.context,
            };
            if event.event_type == "assistant_thread_started" {
                Ok(Some(SlackInboundEvent::AssistantThreadStarted(thread_event)))
            } else {
                Ok(Some(SlackInboundEvent::AssistantThreadContextChanged(
                    thread_event,
                )))
            }
        }
        "app_mention" | "message" => {
            if event.subtype.is_some() || event.bot_id.is_some() {
                return Ok(None);
            }
            if event.user.as_deref() == Some(bot_user_id) {
                return Ok(None);
            }
            let channel = match event.channel {
                Some(channel) if !channel.trim().is_empty() => channel,
                _ => return Ok(None),
            };
            let ts = match event.ts {
                Some(ts) if !ts.trim().is_empty() => ts,
                _ => return Ok(None),
            };
            let message = SlackMessageEvent {
                event_id,
                channel,
                channel_type: event.channel_type,
                user: event.user.filter(|user| !user.trim().is_empty()),
                text: event.text.unwrap_or_default(),
                ts,
                thread_ts: event.thread_ts,
            };
            if event.event_type == "app_mention" {
                Ok(Some(SlackInboundEvent::AppMention(message)))
            } else {
                Ok(Some(SlackInboundEvent::Message(message)))
            }
        }
        _ => Ok(None),
    }
}
