//! Assistant-container flow: greeting, suggested prompts, thread replies and
//! channel summaries.

use anyhow::{anyhow, Result};
use kaiwa_ai::{Message, MessageRole};
use tracing::info;

use super::slack_api_client::{has_slack_error_code, SlackHistoryMessage, SlackSuggestedPrompt};
use super::slack_events::{SlackAssistantThreadEvent, SlackMessageEvent};
use super::thread_context::ThreadContextStore;
use super::SlackBridge;

pub(crate) const GREETING: &str = "Hi there! How can I help you today?";
pub(crate) const TYPING_STATUS: &str = "is typing...";
pub(crate) const SUMMARIZE_PROMPT_TITLE: &str = "Summarize the referenced channel";
pub(crate) const SUMMARIZE_PROMPT_MESSAGE: &str =
    "Can you summarize the conversation in the referenced channel?";
pub(crate) const UNPROCESSABLE_REPLY: &str = "Sorry, I couldn't process that message.";
pub(crate) const SYSTEM_INSTRUCTION: &str = "You are an assistant in a Slack workspace. \
Give professional, helpful answers to the user's questions.";

pub(crate) const CHANNEL_HISTORY_LIMIT: usize = 50;
pub(crate) const THREAD_HISTORY_LIMIT: usize = 10;
pub(crate) const THREAD_REPLIES_PAGE_SIZE: usize = 200;
const MAX_REPLY_PAGES: usize = 20;

const STATIC_PROMPTS: [(&str, &str); 3] = [
    (
        "Ask a technical question",
        "Can you explain a programming or technology topic to me?",
    ),
    (
        "Get help drafting a document",
        "I'd like to write an announcement for a new feature. Can you help me draft it?",
    ),
    (
        "Organize my ideas",
        "Help me organize my project ideas and prioritize them.",
    ),
];

pub(crate) fn suggested_prompts(referenced_channel: Option<&str>) -> Vec<SlackSuggestedPrompt> {
    let mut prompts = STATIC_PROMPTS
        .iter()
        .map(|(title, message)| SlackSuggestedPrompt {
            title: (*title).to_string(),
            message: (*message).to_string(),
        })
        .collect::<Vec<_>>();
    if referenced_channel.is_some() {
        prompts.push(SlackSuggestedPrompt {
            title: SUMMARIZE_PROMPT_TITLE.to_string(),
            message: SUMMARIZE_PROMPT_MESSAGE.to_string(),
        });
    }
    prompts
}

pub(crate) async fn start_assistant_thread(
    bridge: &SlackBridge,
    thread: &SlackAssistantThreadEvent,
) -> Result<()> {
    let metadata = thread.context.to_metadata()?;
    bridge
        .slack_client
        .post_message(
            &thread.channel,
            GREETING,
            Some(&thread.thread_ts),
            Some(&metadata),
        )
        .await?;

    let prompts = suggested_prompts(thread.context.referenced_channel());
    info!(
        channel = %thread.channel,
        thread_ts = %thread.thread_ts,
        user = thread.user.as_deref().unwrap_or("unknown"),
        prompts = prompts.len(),
        "assistant thread started"
    );
    bridge
        .slack_client
        .set_suggested_prompts(&thread.channel, &thread.thread_ts, &prompts)
        .await
}

pub(crate) async fn update_thread_context(
    bridge: &SlackBridge,
    thread: &SlackAssistantThreadEvent,
) -> Result<()> {
    let store = ThreadContextStore::new(&bridge.slack_client, bridge.bot_user_id());
    let updated = store
        .save(&thread.channel, &thread.thread_ts, &thread.context)
        .await?;
    info!(
        channel = %thread.channel,
        thread_ts = %thread.thread_ts,
        updated,
        "assistant thread context changed"
    );
    Ok(())
}

pub(crate) async fn respond_in_assistant_thread(
    bridge: &SlackBridge,
    message: &SlackMessageEvent,
) -> Result<()> {
    let Some(thread_ts) = message.thread_ts.as_deref() else {
        return Ok(());
    };
    bridge
        .slack_client
        .set_status(&message.channel, thread_ts, TYPING_STATUS)
        .await?;

    let turns = if message.text == SUMMARIZE_PROMPT_MESSAGE {
        let store = ThreadContextStore::new(&bridge.slack_client, bridge.bot_user_id());
        let context = store.find(&message.channel, thread_ts).await?;
        let referenced_channel = context
            .as_ref()
            .and_then(|context| context.referenced_channel())
            .ok_or_else(|| anyhow!("this assistant thread does not reference a channel"))?
            .to_string();
        info!(channel = %referenced_channel, "summarizing referenced channel");
        let history = read_channel_history(bridge, &referenced_channel).await?;
        vec![Message::user(render_channel_summary_prompt(
            &referenced_channel,
            &history,
        ))]
    } else {
        read_thread_turns(bridge, &message.channel, thread_ts).await?
    };

    let reply = call_generation(bridge, &turns).await;
    bridge.say(&message.channel, Some(thread_ts), &reply).await
}

/// Reads channel history, joining once and retrying once when the bot is not
/// a member. Any other failure, including one from the retry, propagates.
pub(crate) async fn read_channel_history(
    bridge: &SlackBridge,
    channel: &str,
) -> Result<Vec<SlackHistoryMessage>> {
    match bridge
        .slack_client
        .conversations_history(channel, CHANNEL_HISTORY_LIMIT)
        .await
    {
        Ok(messages) => Ok(messages),
        Err(error) if has_slack_error_code(&error, "not_in_channel") => {
            info!(channel, "joining channel before reading history");
            bridge.slack_client.conversations_join(channel).await?;
            bridge
                .slack_client
                .conversations_history(channel, CHANNEL_HISTORY_LIMIT)
                .await
        }
        Err(error) => Err(error),
    }
}

/// `history` is newest-first; the prompt lists messages oldest-first.
pub(crate) fn render_channel_summary_prompt(
    channel: &str,
    history: &[SlackHistoryMessage],
) -> String {
    let mut prompt =
        format!("Please concisely summarize the messages in the Slack channel <#{channel}>:\n\n");
    for message in history.iter().rev() {
        if let Some(user) = message.user.as_deref() {
            prompt.push_str(&format!("\n<@{user}> said: {}\n", message.text));
        }
    }
    prompt
}

/// Pages through the thread and keeps the trailing [`THREAD_HISTORY_LIMIT`]
/// messages.
async fn read_thread_turns(
    bridge: &SlackBridge,
    channel: &str,
    thread_ts: &str,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_REPLY_PAGES {
        let page = bridge
            .slack_client
            .conversations_replies(
                channel,
                thread_ts,
                THREAD_REPLIES_PAGE_SIZE,
                false,
                cursor.as_deref(),
            )
            .await?;
        messages.extend(page.messages);
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    let skip = messages.len().saturating_sub(THREAD_HISTORY_LIMIT);
    Ok(history_to_turns(&messages[skip..]))
}

pub(crate) fn history_to_turns(messages: &[SlackHistoryMessage]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| {
            if message.bot_id.is_some() {
                Message::assistant_text(message.text.clone())
            } else {
                Message::user(message.text.clone())
            }
        })
        .collect()
}

/// Forwards the history only when its latest turn came from the user.
pub(crate) async fn call_generation(bridge: &SlackBridge, turns: &[Message]) -> String {
    match turns.last() {
        Some(latest) if latest.role == MessageRole::User => {}
        _ => return UNPROCESSABLE_REPLY.to_string(),
    }
    let first_user = turns
        .iter()
        .position(|turn| turn.role == MessageRole::User)
        .unwrap_or(0);
    bridge
        .generate_conversation(&turns[first_user..], Some(SYSTEM_INSTRUCTION))
        .await
}

#[cfg(test)]
mod tests {
    use kaiwa_ai::MessageRole;

    use super::{
        history_to_turns, render_channel_summary_prompt, suggested_prompts,
        SUMMARIZE_PROMPT_MESSAGE,
    };
    use crate::slack_runtime::slack_api_client::SlackHistoryMessage;

    fn history(user: Option<&str>, bot_id: Option<&str>, text: &str) -> SlackHistoryMessage {
        SlackHistoryMessage {
            user: user.map(str::to_string),
            bot_id: bot_id.map(str::to_string),
            text: text.to_string(),
            ..SlackHistoryMessage::default()
        }
    }

    #[test]
    fn unit_suggested_prompts_add_summary_only_with_channel() {
        assert_eq!(suggested_prompts(None).len(), 3);
        let prompts = suggested_prompts(Some("C1"));
        assert_eq!(prompts.len(), 4);
        assert_eq!(prompts[3].message, SUMMARIZE_PROMPT_MESSAGE);
    }

    #[test]
    fn functional_summary_prompt_lists_user_messages_oldest_first() {
        let newest_first = vec![
            history(Some("U2"), None, "second"),
            history(None, Some("B1"), "bot noise"),
            history(Some("U1"), None, "first"),
        ];
        let prompt = render_channel_summary_prompt("C42", &newest_first);
        assert!(prompt.starts_with(
            "Please concisely summarize the messages in the Slack channel <#C42>:"
        ));
        let first = prompt.find("<@U1> said: first").expect("first message");
        let second = prompt.find("<@U2> said: second").expect("second message");
        assert!(first < second);
        assert!(!prompt.contains("bot noise"));
    }

    #[test]
    fn unit_history_roles_follow_bot_id() {
        let turns = history_to_turns(&[
            history(Some("UBOT"), Some("B1"), "greeting"),
            history(Some("U1"), None, "question"),
        ]);
        assert_eq!(turns[0].role, MessageRole::Assistant);
        assert_eq!(turns[1].role, MessageRole::User);
        assert_eq!(turns[1].content, "question");
    }
}
