use courier_core::config::BotIdentity;
use courier_core::types::{ChatKind, ContentKind, InboundEvent, Mention};
use courier_core::CourierError;
use serde::Deserialize;
use tracing::debug;

/// Whether an event should be answered, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// One-to-one chat; always answered.
    Direct,
    /// Group chat in which the bot was mentioned.
    GroupMention,
    /// Not for us; the reason is only logged.
    Ignore(&'static str),
}

impl Trigger {
    pub fn should_process(&self) -> bool {
        !matches!(self, Trigger::Ignore(_))
    }
}

#[derive(Deserialize)]
struct TextContent {
    text: String,
}

/// Decides which events the bot answers and extracts their text.
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    bot: BotIdentity,
    app_id: String,
}

impl TriggerDetector {
    pub fn new(bot: BotIdentity, app_id: impl Into<String>) -> Self {
        Self {
            bot,
            app_id: app_id.into(),
        }
    }

    pub fn detect(&self, event: &InboundEvent) -> Trigger {
        if event.content_kind != ContentKind::Text {
            return Trigger::Ignore("non-text message");
        }
        match &event.chat_kind {
            ChatKind::P2p => Trigger::Direct,
            ChatKind::Group if self.mentions_bot(event) => Trigger::GroupMention,
            ChatKind::Group => Trigger::Ignore("group message without mention"),
            ChatKind::Other(_) => Trigger::Ignore("unknown chat type"),
        }
    }

    /// Mention checks, strongest identity first.
    fn mentions_bot(&self, event: &InboundEvent) -> bool {
        if event.mentions.iter().any(|m| self.is_bot(m)) {
            return true;
        }
        let marker = format!("@_user_{}", self.app_id);
        !self.app_id.is_empty() && event.content.contains(&marker)
    }

    fn is_bot(&self, mention: &Mention) -> bool {
        let eq = |ours: &Option<String>, theirs: &Option<String>| {
            matches!((ours, theirs), (Some(a), Some(b)) if a == b)
        };
        if eq(&self.bot.open_id, &mention.open_id) {
            debug!(key = %mention.key, "bot mentioned by open_id");
            return true;
        }
        if eq(&self.bot.user_id, &mention.user_id) {
            debug!(key = %mention.key, "bot mentioned by user_id");
            return true;
        }
        if eq(&self.bot.app_name, &mention.name) {
            debug!(key = %mention.key, "bot mentioned by name");
            return true;
        }
        let Some(name) = &mention.name else {
            return false;
        };
        self.bot
            .mention_keywords
            .iter()
            .any(|kw| !kw.is_empty() && name.contains(kw.as_str()))
    }

    /// User text of a text message, with mention placeholders resolved.
    ///
    /// The bot's own mentions are removed, other users' become `@name`, and
    /// any unresolved `@_user_N` key is dropped.
    pub fn parse_text(&self, event: &InboundEvent) -> Result<String, CourierError> {
        // `detect` already ignores non-text events; this covers direct callers.
        if event.content_kind != ContentKind::Text {
            return Err(CourierError::UnsupportedContent(format!(
                "message type {:?}",
                event.content_kind
            )));
        }
        let TextContent { text } = serde_json::from_str(&event.content)
            .map_err(|e| CourierError::UnsupportedContent(format!("malformed text content: {e}")))?;

        // Longest keys first so `@_user_1` never eats the prefix of `@_user_10`.
        let mut mentions: Vec<&Mention> = event.mentions.iter().filter(|m| !m.key.is_empty()).collect();
        mentions.sort_by_key(|m| std::cmp::Reverse(m.key.len()));

        let mut text = text;
        for mention in mentions {
            let replacement = match &mention.name {
                Some(name) if !self.is_bot(mention) => format!("@{name}"),
                _ => String::new(),
            };
            text = text.replace(&mention.key, &replacement);
        }

        Ok(strip_user_keys(&text).trim().to_string())
    }
}

/// Remove leftover `@_user_<alnum>` placeholders.
fn strip_user_keys(text: &str) -> String {
    const KEY: &str = "@_user_";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(KEY) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + KEY.len()..];
        let end = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}
