//! Splitting long replies into size-bounded, annotated segments.
//!
//! Break points are searched backwards from the hard limit inside a lookback
//! window, preferring (in order) a paragraph break, sentence-ending
//! punctuation followed by a newline, any newline, then a space. Without any
//! of those the text is hard-cut on a character boundary, stepping back out
//! of a run of markup characters if that stays inside the window.
//!
//! Open code fences are closed at the end of a segment and reopened (with
//! the same language tag) at the start of the next one.

use courier_core::config::DeliveryConfig;
use tracing::{debug, warn};

const FENCE: &str = "```";
const MARKUP: &[char] = &['*', '_', '~', '`'];
const SENTENCE_END: &[char] = &['.', '!', '?', '。', '！', '？', '…'];

/// Longest language tag carried over when a fence is reopened.
const MAX_FENCE_LANG: usize = 32;

/// Appended to the final segment when overflow segments were dropped.
pub const TRUNCATION_MARKER: &str = "\n\n⚠️ _Reply truncated for length._";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based position.
    pub index: usize,
    pub total: usize,
    pub text: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// The whole reply replaces the placeholder in one edit.
    Edit,
    /// The reply is spread over several messages.
    Segmented,
}

/// Deterministic description of how a reply will be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub segments: Vec<Segment>,
    pub mode: PlanMode,
    /// Segments past the cap were dropped.
    pub truncated: bool,
}

impl DeliveryPlan {
    /// Single-edit plan carrying `text` unchanged.
    pub fn edit(text: &str) -> Self {
        Self {
            segments: vec![Segment {
                index: 1,
                total: 1,
                text: text.to_string(),
                size_bytes: text.len(),
            }],
            mode: PlanMode::Edit,
            truncated: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentPolicy {
    /// Preferred segment length in characters.
    pub target_chars: usize,
    /// Hard cap on a rendered segment, annotation and fences included.
    pub max_bytes: usize,
    pub lookback_bytes: usize,
    pub max_segments: usize,
}

impl From<&DeliveryConfig> for SegmentPolicy {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            target_chars: cfg.chunk_target_chars,
            max_bytes: cfg.segment_max_bytes,
            lookback_bytes: cfg.lookback_bytes,
            max_segments: cfg.max_segments,
        }
    }
}

pub struct SegmentPlanner {
    policy: SegmentPolicy,
}

impl SegmentPlanner {
    pub fn new(policy: SegmentPolicy) -> Self {
        Self { policy }
    }

    /// Plan sized by the raw UTF-8 length of each segment.
    pub fn plan(&self, text: &str) -> DeliveryPlan {
        self.plan_measured(text, &|s: &str| s.len())
    }

    /// Plan in which every segment satisfies `measure(segment) <= max_bytes`.
    ///
    /// `measure` is the size of a segment once serialized for the channel
    /// (payload wrapper and escapes included). The body budget starts from
    /// the raw-text reservation and shrinks until every segment fits.
    pub fn plan_measured(&self, text: &str, measure: &dyn Fn(&str) -> usize) -> DeliveryPlan {
        let max_bytes = self.policy.max_bytes;
        let mut budget = self.body_limit();

        loop {
            let mut plan = self.plan_with_budget(text, budget);
            let mut worst = 0;
            for seg in &mut plan.segments {
                seg.size_bytes = measure(&seg.text);
                worst = worst.max(seg.size_bytes);
            }
            if worst <= max_bytes {
                return plan;
            }
            if budget <= 1 {
                warn!(worst, max_bytes, "segment cannot be made to fit the channel limit");
                return plan;
            }

            let overshoot = worst - max_bytes;
            let scaled = budget.saturating_mul(max_bytes) / worst;
            let next = scaled.min(budget.saturating_sub(overshoot)).min(budget - 1).max(1);
            debug!(budget, next, worst, max_bytes, "rendered segment too large, shrinking body budget");
            budget = next;
        }
    }

    fn plan_with_budget(&self, text: &str, budget: usize) -> DeliveryPlan {
        let mut bodies = split_bodies(
            text,
            self.policy.target_chars.max(1),
            budget,
            self.policy.lookback_bytes,
        );

        let max_segments = self.policy.max_segments.max(1);
        let truncated = bodies.len() > max_segments;
        if truncated {
            warn!(
                produced = bodies.len(),
                kept = max_segments,
                "reply exceeds segment cap, dropping overflow"
            );
            bodies.truncate(max_segments);
        }

        let total = bodies.len();
        let mut open_fence: Option<String> = None;
        let mut segments = Vec::with_capacity(total);

        for (i, body) in bodies.into_iter().enumerate() {
            let mut out = String::with_capacity(body.len() + 64);
            if total > 1 {
                out.push_str(&format!("({}/{})\n", i + 1, total));
            }
            if let Some(lang) = &open_fence {
                out.push_str(FENCE);
                out.push_str(lang);
                out.push('\n');
            }
            out.push_str(body);

            open_fence = fence_state_after(body, open_fence);
            if open_fence.is_some() {
                out.push('\n');
                out.push_str(FENCE);
            }
            if truncated && i + 1 == total {
                out.push_str(TRUNCATION_MARKER);
            }

            segments.push(Segment {
                index: i + 1,
                total,
                size_bytes: out.len(),
                text: out,
            });
        }

        DeliveryPlan {
            segments,
            mode: PlanMode::Segmented,
            truncated,
        }
    }

    /// Byte budget for a segment body once decorations are reserved.
    fn body_limit(&self) -> usize {
        let digits = self.policy.max_segments.max(1).to_string().len();
        let annotation = 2 * digits + 4;
        let fences = 2 * FENCE.len() + MAX_FENCE_LANG + 2;
        let reserve = annotation + fences + TRUNCATION_MARKER.len();
        self.policy.max_bytes.saturating_sub(reserve).max(1)
    }
}

fn split_bodies(text: &str, target_chars: usize, limit: usize, lookback: usize) -> Vec<&str> {
    let mut bodies = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let hard = hard_limit(rest, target_chars, limit);
        if hard >= rest.len() {
            push_body(&mut bodies, rest);
            break;
        }
        let cut = find_break(rest, hard, lookback);
        let (head, tail) = rest.split_at(cut);
        push_body(&mut bodies, head);
        rest = tail;
    }

    bodies
}

fn push_body<'a>(bodies: &mut Vec<&'a str>, body: &'a str) {
    let body = body.trim_end();
    if !body.is_empty() {
        bodies.push(body);
    }
}

/// Byte offset of the furthest allowed cut: `target_chars` characters or
/// `limit` bytes, whichever comes first. Always at least one character.
fn hard_limit(text: &str, target_chars: usize, limit: usize) -> usize {
    let by_chars = text
        .char_indices()
        .nth(target_chars)
        .map_or(text.len(), |(i, _)| i);
    let hard = by_chars.min(floor_char_boundary(text, limit));
    if hard == 0 {
        text.chars().next().map_or(0, char::len_utf8)
    } else {
        hard
    }
}

fn find_break(text: &str, hard: usize, lookback: usize) -> usize {
    let start = floor_char_boundary(text, hard.saturating_sub(lookback));
    let window = &text[start..hard];

    if let Some(p) = window.rfind("\n\n") {
        return start + p + 2;
    }

    for (p, _) in window.rmatch_indices('\n') {
        let before = text[..start + p].trim_end_matches(MARKUP);
        if before
            .chars()
            .last()
            .is_some_and(|c| SENTENCE_END.contains(&c))
        {
            return start + p + 1;
        }
    }

    if let Some(p) = window.rfind('\n') {
        return start + p + 1;
    }
    if let Some(p) = window.rfind(' ') {
        return start + p + 1;
    }

    avoid_markup_run(text, start, hard)
}

fn avoid_markup_run(text: &str, start: usize, hard: usize) -> usize {
    let is_markup = |c: char| MARKUP.contains(&c);
    let inside_run = text[..hard].chars().last().is_some_and(is_markup)
        && text[hard..].chars().next().is_some_and(is_markup);
    if !inside_run {
        return hard;
    }

    let run_start = text[..hard].trim_end_matches(MARKUP).len();
    if run_start > start {
        run_start
    } else {
        hard
    }
}

/// Fence language open after `body`, given the state before it.
fn fence_state_after(body: &str, mut open: Option<String>) -> Option<String> {
    for line in body.split('\n') {
        if let Some(after) = line.trim_start().strip_prefix(FENCE) {
            if open.is_some() {
                open = None;
            } else {
                let lang = after.trim();
                open = Some(if lang.len() <= MAX_FENCE_LANG {
                    lang.to_string()
                } else {
                    String::new()
                });
            }
        }
    }
    open
}

/// Largest char boundary `<= index`.
pub(crate) fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(target_chars: usize, max_bytes: usize, lookback: usize, max_segments: usize) -> SegmentPlanner {
        SegmentPlanner::new(SegmentPolicy {
            target_chars,
            max_bytes,
            lookback_bytes: lookback,
            max_segments,
        })
    }

    fn fence_count(s: &str) -> usize {
        s.lines().filter(|l| l.trim_start().starts_with(FENCE)).count()
    }

    #[test]
    fn short_text_is_one_unannotated_segment() {
        let plan = SegmentPlanner::new(SegmentPolicy::from(&DeliveryConfig::default()))
            .plan("Hello there.");
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.segments[0].text, "Hello there.");
        assert!(!plan.truncated);
    }

    #[test]
    fn quarter_million_chars_respect_bounds() {
        let paragraph = "Lorem ipsum dolor sit amet, **consectetur** adipiscing elit. \
                         这是一段用于测试分段的中文内容。\n\n";
        let mut text = String::new();
        while text.chars().count() < 250_000 {
            text.push_str(paragraph);
        }
        let text: String = text.chars().take(250_000).collect();

        let cfg = DeliveryConfig::default();
        let plan = SegmentPlanner::new(SegmentPolicy::from(&cfg)).plan(&text);

        assert!(!plan.segments.is_empty());
        assert!(plan.segments.len() <= cfg.max_segments);
        assert!(plan.truncated);
        for (i, seg) in plan.segments.iter().enumerate() {
            assert_eq!(seg.index, i + 1);
            assert_eq!(seg.total, plan.segments.len());
            assert_eq!(seg.size_bytes, seg.text.len());
            assert!(
                seg.size_bytes <= cfg.segment_max_bytes,
                "segment {} is {} bytes",
                seg.index,
                seg.size_bytes
            );
            assert!(seg.text.starts_with(&format!("({}/{})\n", seg.index, seg.total)));
            if seg.index < seg.total {
                let (_, body) = seg.text.split_once('\n').unwrap();
                let end = body.chars().last().unwrap();
                assert!(
                    SENTENCE_END.contains(&end),
                    "segment {} ends mid-sentence with {:?}",
                    seg.index,
                    end
                );
            }
        }
        let last = plan.segments.last().unwrap();
        assert!(last.text.ends_with(TRUNCATION_MARKER));
    }

    /// Stand-in for a JSON card wrapper: fixed envelope plus escaped newlines and quotes.
    fn wrapped_size(text: &str) -> usize {
        120 + text.len() + text.matches(|c: char| c == '\n' || c == '"').count()
    }

    #[test]
    fn measured_plan_fits_rendered_limit() {
        let mut text = String::new();
        while text.chars().count() < 60_000 {
            text.push_str("这是一个\"引用\"的句子。\n");
        }

        let cfg = DeliveryConfig::default();
        let planner = SegmentPlanner::new(SegmentPolicy::from(&cfg));
        assert!(
            planner
                .plan(&text)
                .segments
                .iter()
                .any(|seg| wrapped_size(&seg.text) > cfg.segment_max_bytes),
            "raw sizing should overflow once wrapped"
        );

        let plan = planner.plan_measured(&text, &wrapped_size);
        assert!(plan.segments.len() > 1);
        for seg in &plan.segments {
            assert_eq!(seg.size_bytes, wrapped_size(&seg.text));
            assert!(
                seg.size_bytes <= cfg.segment_max_bytes,
                "segment {} renders to {} bytes",
                seg.index,
                seg.size_bytes
            );
        }
        let rejoined: String = plan
            .segments
            .iter()
            .map(|s| s.text.split_once('\n').map_or(s.text.as_str(), |(_, b)| b))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(rejoined, text.trim_end());
    }

    #[test]
    fn unfittable_measure_still_terminates() {
        let plan = planner(100, 50, 10, 5).plan_measured("abcdef", &|_: &str| 1_000);
        assert!(!plan.segments.is_empty());
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = "First paragraph here.\n\nSecond one goes on and on.";
        let plan = planner(30, 10_000, 30, 10).plan(text);
        assert_eq!(plan.segments.len(), 2);
        assert!(plan.segments[0].text.ends_with("First paragraph here."));
        assert!(plan.segments[1].text.ends_with("Second one goes on and on."));
    }

    #[test]
    fn prefers_sentence_end_over_plain_newline() {
        let text = "Line one is done.\nline two without end\nline three continues here";
        let plan = planner(50, 10_000, 50, 10).plan(text);
        assert!(plan.segments[0].text.ends_with("Line one is done."));
    }

    #[test]
    fn hard_cut_never_splits_characters() {
        let text = "你".repeat(400);
        let plan = planner(1000, 200, 50, 100).plan(&text);
        assert!(plan.segments.len() > 1);
        let rejoined: String = plan
            .segments
            .iter()
            .map(|s| s.text.split_once('\n').map_or(s.text.as_str(), |(_, b)| b))
            .collect();
        assert_eq!(rejoined, text);
        for seg in &plan.segments {
            assert!(seg.size_bytes <= 200);
        }
    }

    #[test]
    fn hard_cut_steps_out_of_markup_runs() {
        let text = "abcdefghi**bold**rest";
        let bodies = split_bodies(text, 10, 1000, 5);
        assert_eq!(bodies[0], "abcdefghi");
        assert!(bodies[1].starts_with("**bold"));
    }

    #[test]
    fn code_fences_are_closed_and_reopened() {
        let mut text = String::from("Intro:\n```rust\n");
        for i in 0..30 {
            text.push_str(&format!("let x{i} = {i};\n"));
        }
        text.push_str("```\nThat's it.");

        let plan = planner(80, 10_000, 80, 20).plan(&text);
        assert!(plan.segments.len() > 2);
        for seg in &plan.segments {
            assert_eq!(fence_count(&seg.text) % 2, 0, "unbalanced: {}", seg.text);
        }
        assert!(plan.segments[1].text.contains("\n```rust\n"));
        assert!(plan.segments.last().unwrap().text.ends_with("That's it."));
    }

    #[test]
    fn long_fence_language_is_not_carried() {
        let lang = "x".repeat(MAX_FENCE_LANG + 1);
        assert_eq!(fence_state_after(&format!("```{lang}\ncode"), None), Some(String::new()));
        assert_eq!(fence_state_after("```\ncode\n```", None), None);
    }

    #[test]
    fn edit_plan_is_single_segment() {
        let plan = DeliveryPlan::edit("hi");
        assert_eq!(plan.mode, PlanMode::Edit);
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.segments[0].size_bytes, 2);
    }

    #[test]
    fn floor_boundary_handles_multibyte() {
        let s = "a你b";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 4), 4);
        assert_eq!(floor_char_boundary(s, 99), s.len());
    }
}
