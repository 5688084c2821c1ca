//! Assistant thread context persisted as Slack message metadata.
//!
//! The greeting posted on `assistant_thread_started` carries the context the
//! thread was opened from. Later events recover it from that message instead
//! of keeping per-thread state in the process.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::slack_api_client::{SlackApiClient, SlackHistoryMessage, SlackMessageMetadata};

pub(crate) const THREAD_CONTEXT_EVENT_TYPE: &str = "assistant_thread_context";
const THREAD_CONTEXT_LOOKUP_LIMIT: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AssistantThreadContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) enterprise_id: Option<String>,
}

impl AssistantThreadContext {
    pub(crate) fn referenced_channel(&self) -> Option<&str> {
        self.channel_id
            .as_deref()
            .filter(|channel| !channel.trim().is_empty())
    }

    pub(crate) fn to_metadata(&self) -> Result<SlackMessageMetadata> {
        Ok(SlackMessageMetadata {
            event_type: THREAD_CONTEXT_EVENT_TYPE.to_string(),
            event_payload: serde_json::to_value(self)?,
        })
    }

    fn from_metadata(metadata: &SlackMessageMetadata) -> Option<Self> {
        if metadata.event_type != THREAD_CONTEXT_EVENT_TYPE {
            return None;
        }
        serde_json::from_value(metadata.event_payload.clone()).ok()
    }
}

pub(crate) struct ThreadContextStore<'a> {
    client: &'a SlackApiClient,
    bot_user_id: &'a str,
}

impl<'a> ThreadContextStore<'a> {
    pub(crate) fn new(client: &'a SlackApiClient, bot_user_id: &'a str) -> Self {
        Self {
            client,
            bot_user_id,
        }
    }

    async fn find_message(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<(SlackHistoryMessage, AssistantThreadContext)>> {
        let page = self
            .client
            .conversations_replies(
                channel,
                thread_ts,
                THREAD_CONTEXT_LOOKUP_LIMIT,
                true,
                None,
            )
            .await?;
        Ok(page.messages.into_iter().find_map(|message| {
            if message.user.as_deref() != Some(self.bot_user_id) {
                return None;
            }
            let context = message
                .metadata
                .as_ref()
                .and_then(AssistantThreadContext::from_metadata)?;
            Some((message, context))
        }))
    }

    pub(crate) async fn find(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<AssistantThreadContext>> {
        Ok(self
            .find_message(channel, thread_ts)
            .await?
            .map(|(_, context)| context))
    }

    /// Rewrites the metadata on the bot message that carries the context.
    /// Returns false when no such message exists.
    pub(crate) async fn save(
        &self,
        channel: &str,
        thread_ts: &str,
        context: &AssistantThreadContext,
    ) -> Result<bool> {
        let Some((message, _)) = self.find_message(channel, thread_ts).await? else {
            debug!(channel, thread_ts, "no thread context message to update");
            return Ok(false);
        };
        let Some(ts) = message.ts.as_deref() else {
            return Ok(false);
        };
        let metadata = context.to_metadata()?;
        self.client
            .update_message(channel, ts, &message.text, Some(&metadata))
            .await?;
        Ok(true)
    }
}
