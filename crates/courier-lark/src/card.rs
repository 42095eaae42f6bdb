//! Rendering outbound content into Lark message payloads.

use courier_channels::OutboundContent;
use courier_core::types::PayloadKind;
use serde_json::json;

/// `msg_type` plus the JSON-encoded `content` string Lark expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub msg_type: &'static str,
    pub content: String,
}

pub fn render(content: &OutboundContent) -> RenderedMessage {
    match content.kind {
        PayloadKind::Text => RenderedMessage {
            msg_type: "text",
            content: json!({ "text": content.text }).to_string(),
        },
        PayloadKind::Card => RenderedMessage {
            msg_type: "interactive",
            content: markdown_card(&content.text).to_string(),
        },
    }
}

/// Single-block card with the text rendered as Lark markdown.
pub fn markdown_card(markdown: &str) -> serde_json::Value {
    json!({
        "config": { "wide_screen_mode": true },
        "elements": [
            {
                "tag": "div",
                "text": { "tag": "lark_md", "content": markdown }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use courier_channels::segment::{SegmentPlanner, SegmentPolicy};
    use courier_core::config::DeliveryConfig;

    use super::*;

    #[test]
    fn text_payload_is_json_wrapped() {
        let r = render(&OutboundContent::text("hi \"there\""));
        assert_eq!(r.msg_type, "text");
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["text"], "hi \"there\"");
    }

    #[test]
    fn card_payload_uses_lark_md() {
        let r = render(&OutboundContent::card("**bold**"));
        assert_eq!(r.msg_type, "interactive");
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["config"]["wide_screen_mode"], true);
        assert_eq!(v["elements"][0]["text"]["tag"], "lark_md");
        assert_eq!(v["elements"][0]["text"]["content"], "**bold**");
    }

    #[test]
    fn rendered_card_is_larger_than_text() {
        let text = "line\n".repeat(100);
        let card = render(&OutboundContent::card(text.clone()));
        assert!(card.content.len() > text.len());
    }

    #[test]
    fn long_chinese_reply_segments_fit_rendered_card_limit() {
        let mut text = String::new();
        while text.chars().count() < 60_000 {
            text.push_str("这是一个关于\"分段\"发送的长回答。\n");
        }
        let cfg = DeliveryConfig::default();
        let planner = SegmentPlanner::new(SegmentPolicy::from(&cfg));
        let card_size = |s: &str| render(&OutboundContent::card(s)).content.len();

        let plan = planner.plan_measured(&text, &card_size);

        assert!(plan.segments.len() > 1);
        for seg in &plan.segments {
            let size = card_size(&seg.text);
            assert!(
                size <= cfg.card_max_bytes,
                "segment {} renders to {} bytes",
                seg.index,
                size
            );
        }
    }
}
