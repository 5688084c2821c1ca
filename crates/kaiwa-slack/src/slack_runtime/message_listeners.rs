//! Stateless listeners: app mentions, direct messages and keyword replies.

use anyhow::Result;
use tracing::info;

use super::slack_events::SlackMessageEvent;
use super::SlackBridge;
use crate::slack_helpers::strip_bot_mention;

pub(crate) const EMPTY_MENTION_REPLY: &str =
    "Hi there! Mention me with a question and I'll do my best to answer.";

pub(crate) const PING_REPLY: &str = "🏓 Pong! I'm alive and ready to help!";

pub(crate) const HELP_TEXT: &str = "\
🤖 *AI Chatbot Help*

I'm an AI assistant powered by Google's Gemini model. Here's how to interact with me:

*Direct Messages:*
• Send me a direct message with any question or request
• I'll respond with AI-generated answers

*In Channels:*
• Mention me (@botname) followed by your message
• I'll respond in the channel thread

*Examples:*
• \"What is the weather like today?\"
• \"Help me write a Python function\"
• \"Explain quantum computing\"
• \"Tell me a joke\"

*Commands:*
• `hello` - Get a greeting
• `help` - Show this help message

Feel free to ask me anything! 🚀";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeywordListener {
    Hello,
    Help,
    Ping,
}

impl KeywordListener {
    /// Match precedence; the first keyword found in the text wins.
    const REGISTRATION_ORDER: [Self; 3] = [Self::Hello, Self::Help, Self::Ping];

    pub(crate) fn keyword(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Help => "help",
            Self::Ping => "ping",
        }
    }

    pub(crate) fn reply(self, user: Option<&str>) -> String {
        match self {
            Self::Hello => format!(
                "Hello <@{}>! I'm an AI assistant powered by Gemini. How can I help you today?",
                user.unwrap_or("there")
            ),
            Self::Help => HELP_TEXT.to_string(),
            Self::Ping => PING_REPLY.to_string(),
        }
    }
}

/// Case-sensitive literal substring match, in registration order.
pub(crate) fn match_keyword(text: &str) -> Option<KeywordListener> {
    KeywordListener::REGISTRATION_ORDER
        .into_iter()
        .find(|listener| text.contains(listener.keyword()))
}

pub(crate) async fn handle_keyword(
    bridge: &SlackBridge,
    message: &SlackMessageEvent,
    keyword: KeywordListener,
) -> Result<()> {
    info!(
        channel = %message.channel,
        keyword = keyword.keyword(),
        "keyword listener matched"
    );
    let reply = keyword.reply(message.user.as_deref());
    bridge
        .say(&message.channel, message.thread_ts.as_deref(), &reply)
        .await
}

pub(crate) async fn handle_app_mention(
    bridge: &SlackBridge,
    message: &SlackMessageEvent,
) -> Result<()> {
    let thread_ts = message.thread_ts.as_deref().unwrap_or(message.ts.as_str());
    let prompt = strip_bot_mention(&message.text, bridge.bot_user_id());
    if prompt.is_empty() {
        return bridge
            .say(&message.channel, Some(thread_ts), EMPTY_MENTION_REPLY)
            .await;
    }

    info!(channel = %message.channel, thread_ts, "answering app mention");
    let reply = bridge.generate(&prompt).await;
    bridge.say(&message.channel, Some(thread_ts), &reply).await
}

pub(crate) async fn handle_direct_message(
    bridge: &SlackBridge,
    message: &SlackMessageEvent,
) -> Result<()> {
    let prompt = message.text.trim();
    if prompt.is_empty() {
        return Ok(());
    }
    info!(channel = %message.channel, "answering direct message");
    let reply = bridge.generate(prompt).await;
    bridge.say(&message.channel, None, &reply).await
}

#[cfg(test)]
mod tests {
    use super::{match_keyword, KeywordListener, HELP_TEXT, PING_REPLY};

    #[test]
    fn unit_match_keyword_is_case_sensitive_substring() {
        assert_eq!(match_keyword("oh hello there"), Some(KeywordListener::Hello));
        assert_eq!(match_keyword("I need help"), Some(KeywordListener::Help));
        assert_eq!(match_keyword("ping"), Some(KeywordListener::Ping));
        assert_eq!(match_keyword("shopping list"), Some(KeywordListener::Ping));
        assert_eq!(match_keyword("Hello"), None);
        assert_eq!(match_keyword("HELP"), None);
        assert_eq!(match_keyword("what is rust?"), None);
    }

    #[test]
    fn regression_first_registered_keyword_wins() {
        assert_eq!(
            match_keyword("ping me for help, hello"),
            Some(KeywordListener::Hello)
        );
        assert_eq!(match_keyword("ping then help"), Some(KeywordListener::Help));
    }

    #[test]
    fn unit_keyword_replies_use_templates() {
        assert_eq!(
            KeywordListener::Hello.reply(Some("U123")),
            "Hello <@U123>! I'm an AI assistant powered by Gemini. How can I help you today?"
        );
        assert!(KeywordListener::Hello.reply(None).starts_with("Hello <@there>!"));
        assert_eq!(KeywordListener::Help.reply(None), HELP_TEXT);
        assert_eq!(KeywordListener::Ping.reply(Some("U1")), PING_REPLY);
        assert!(HELP_TEXT.contains("`help` - Show this help message"));
    }
}
