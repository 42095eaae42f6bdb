//! Truncation detection and the one-shot continuation protocol.
//!
//! A completion counts as truncated when it used nearly all of its token
//! budget *and* its tail looks unfinished. Truncated results get exactly one
//! continuation request; its text is appended to the original.
//!
//! The tail check lives behind [`TruncationHeuristic`]. The default
//! implementation is punctuation- and keyword-based and tuned for English and
//! Chinese text; it is a best-effort signal, not a correctness guarantee.

use std::sync::Arc;

use courier_core::config::TruncationConfig;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::provider::{CompletionProvider, CompletionRequest, Message, ProviderError};
use crate::stream::StreamEvent;

const FENCE: &str = "```";

/// Longest overlap (in chars) trimmed when a continuation repeats the tail.
const MAX_OVERLAP_CHARS: usize = 200;

const CONTINUATION_PROMPT: &str = "Your previous reply was cut off before it was finished. \
Continue exactly where it stopped, mid-sentence or mid-code if necessary. \
Do not repeat anything already written and do not add a preamble.";

/// Decides whether a piece of text stops before its logical end.
pub trait TruncationHeuristic: Send + Sync {
    fn looks_incomplete(&self, text: &str) -> bool;
}

/// Trailing-window heuristic: missing terminal punctuation, an unbalanced
/// code fence, or a dangling connective/operator at the very end.
pub struct TrailingPatternHeuristic {
    window_chars: usize,
}

/// Individual signals reported by [`TrailingPatternHeuristic::signals`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailSignals {
    pub missing_terminal: bool,
    pub unbalanced_fence: bool,
    pub dangling_tail: bool,
}

impl TailSignals {
    pub fn any(&self) -> bool {
        self.missing_terminal || self.unbalanced_fence || self.dangling_tail
    }
}

const TERMINAL_CHARS: &[char] = &[
    '.', '!', '?', '。', '！', '？', '…', '"', '\'', ')', ']', '}', '”', '’', '）', '】', '》',
    '」', '`', '>', '|',
];

/// Closing markup that may follow the real last character (`**done.**`).
const TRAILING_MARKUP: &[char] = &['*', '_', '~'];

const DANGLING_SYMBOLS: &[char] = &[
    ',', ':', ';', '(', '[', '{', '，', '：', '；', '、', '（', '【', '《', '“', '‘', '\\',
];

const DANGLING_OPERATORS: &[&str] = &[
    "=", "+", "-", "*", "/", "%", "<", ">", "==", "!=", "<=", ">=", "&&", "||", "->", "=>",
    "::", "+=", "-=", "&", "^", "|",
];

const DANGLING_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "because", "but", "by", "for", "from", "if",
    "in", "into", "is", "of", "on", "or", "so", "than", "that", "the", "then", "to", "was",
    "which", "while", "with",
];

const DANGLING_CJK: &[&str] = &[
    "和", "或", "与", "及", "以及", "并且", "而且", "但是", "因为", "所以", "如果", "然后", "的",
    "是", "在",
];

impl TrailingPatternHeuristic {
    pub fn new(window_chars: usize) -> Self {
        Self {
            window_chars: window_chars.max(1),
        }
    }

    pub fn signals(&self, text: &str) -> TailSignals {
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return TailSignals::default();
        }
        let tail = last_chars(trimmed, self.window_chars);

        TailSignals {
            missing_terminal: !ends_with_terminal(tail),
            unbalanced_fence: text.matches(FENCE).count() % 2 == 1,
            dangling_tail: ends_dangling(tail),
        }
    }
}

impl Default for TrailingPatternHeuristic {
    fn default() -> Self {
        Self::new(50)
    }
}

impl TruncationHeuristic for TrailingPatternHeuristic {
    fn looks_incomplete(&self, text: &str) -> bool {
        self.signals(text).any()
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    match text.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn ends_with_terminal(tail: &str) -> bool {
    let stripped = tail.trim_end_matches(|c: char| c.is_whitespace() || TRAILING_MARKUP.contains(&c));
    stripped
        .chars()
        .last()
        .is_some_and(|c| TERMINAL_CHARS.contains(&c))
}

fn ends_dangling(tail: &str) -> bool {
    let Some(last_char) = tail.chars().last() else {
        return false;
    };
    if DANGLING_SYMBOLS.contains(&last_char) {
        return true;
    }
    if DANGLING_CJK.iter().any(|w| tail.ends_with(w)) {
        return true;
    }
    let Some(last_token) = tail.split_whitespace().last() else {
        return false;
    };
    if DANGLING_OPERATORS.contains(&last_token) {
        return true;
    }
    let word = last_token.to_ascii_lowercase();
    DANGLING_WORDS.contains(&word.as_str())
}

/// Limits that drive truncation decisions.
#[derive(Debug, Clone)]
pub struct TruncationPolicy {
    /// Streaming stops once this many characters have been accumulated.
    pub ceiling_chars: usize,
    /// `used / max` at or above this counts as an exhausted budget.
    pub usage_ratio: f64,
    /// Minimum `max_tokens` for the continuation request.
    pub continuation_floor: u32,
}

impl From<&TruncationConfig> for TruncationPolicy {
    fn from(cfg: &TruncationConfig) -> Self {
        Self {
            ceiling_chars: cfg.stream_ceiling_chars,
            usage_ratio: cfg.usage_ratio,
            continuation_floor: cfg.continuation_floor_tokens,
        }
    }
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        Self {
            ceiling_chars: 45_000,
            usage_ratio: 0.95,
            continuation_floor: 1000,
        }
    }
}

/// Final text plus the accounting used to reach it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub text: String,
    /// Output tokens across the original request and any continuation.
    pub used_tokens: u32,
    /// Whether the first response was judged truncated.
    pub declared_truncated: bool,
    /// Whether a continuation was appended.
    pub continued: bool,
    /// Whether streaming was stopped at the safety ceiling.
    pub ceiling_hit: bool,
}

struct Collected {
    text: String,
    used_tokens: u32,
    ceiling_hit: bool,
}

/// Wraps a [`CompletionProvider`] with truncation detection and continuation.
pub struct TruncationGuard {
    provider: Arc<dyn CompletionProvider>,
    heuristic: Box<dyn TruncationHeuristic>,
    policy: TruncationPolicy,
}

impl TruncationGuard {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        heuristic: Box<dyn TruncationHeuristic>,
        policy: TruncationPolicy,
    ) -> Self {
        Self {
            provider,
            heuristic,
            policy,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run a completion, optionally streaming, and continue it once if it
    /// was cut off.
    ///
    /// Fails only when the first provider call fails; a failed continuation
    /// returns the original text.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
        streaming: bool,
    ) -> Result<CompletionResult, ProviderError> {
        let first = if streaming {
            self.collect_stream(req).await?
        } else {
            let resp = self.provider.invoke(req).await?;
            Collected {
                text: resp.text,
                used_tokens: resp.tokens_out,
                ceiling_hit: false,
            }
        };

        let truncated = self.is_truncated(&first.text, first.used_tokens, req.max_tokens);
        let mut result = CompletionResult {
            text: first.text,
            used_tokens: first.used_tokens,
            declared_truncated: truncated,
            continued: false,
            ceiling_hit: first.ceiling_hit,
        };

        if !truncated {
            return Ok(result);
        }
        if result.ceiling_hit {
            info!(
                chars = self.policy.ceiling_chars,
                "response hit the streaming ceiling, not continuing"
            );
            return Ok(result);
        }

        info!(
            used_tokens = result.used_tokens,
            max_tokens = req.max_tokens,
            provider = %self.provider.name(),
            "response looks truncated, requesting continuation"
        );

        let continuation = continuation_request(req, &result.text, result.used_tokens, &self.policy);
        match self.provider.invoke(&continuation).await {
            Ok(resp) => {
                let addition = strip_overlap(&result.text, &resp.text);
                debug!(added = addition.len(), "continuation received");
                result.text.push_str(addition);
                result.used_tokens = result.used_tokens.saturating_add(resp.tokens_out);
                result.continued = true;
            }
            Err(e) => {
                warn!(error = %e, "continuation failed, returning truncated text");
            }
        }

        Ok(result)
    }

    /// `used / max ≥ ratio` and the heuristic reports an unfinished tail.
    pub fn is_truncated(&self, text: &str, used_tokens: u32, max_tokens: u32) -> bool {
        if max_tokens == 0 {
            return false;
        }
        let ratio = f64::from(used_tokens) / f64::from(max_tokens);
        ratio >= self.policy.usage_ratio && self.heuristic.looks_incomplete(text)
    }

    async fn collect_stream(&self, req: &CompletionRequest) -> Result<Collected, ProviderError> {
        let mut stream = self.provider.invoke_streaming(req).await?;
        let mut text = String::new();
        let mut chars = 0usize;
        let mut used_tokens = 0u32;
        let mut ceiling_hit = false;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { text: delta } => {
                    chars += delta.chars().count();
                    text.push_str(&delta);
                    if chars >= self.policy.ceiling_chars {
                        truncate_chars(&mut text, self.policy.ceiling_chars);
                        ceiling_hit = true;
                        warn!(chars, ceiling = self.policy.ceiling_chars, "streaming ceiling reached, aborting");
                        break;
                    }
                }
                StreamEvent::Done {
                    tokens_out, model, ..
                } => {
                    used_tokens = tokens_out;
                    debug!(%model, tokens_out, chars, "stream complete");
                    break;
                }
                StreamEvent::Error { message } => {
                    if text.is_empty() {
                        return Err(ProviderError::Stream(message));
                    }
                    warn!(error = %message, chars, "stream failed midway, keeping partial text");
                    break;
                }
            }
        }

        Ok(Collected {
            text,
            used_tokens,
            ceiling_hit,
        })
    }
}

/// Build the follow-up request: original turns, the partial answer, then an
/// instruction to resume. Budget is `max(floor, budget - used)`.
fn continuation_request(
    req: &CompletionRequest,
    partial: &str,
    used_tokens: u32,
    policy: &TruncationPolicy,
) -> CompletionRequest {
    let mut messages = req.messages.clone();
    messages.push(Message::assistant(partial.trim_end()));
    messages.push(Message::user(CONTINUATION_PROMPT));

    CompletionRequest {
        model: req.model.clone(),
        system: req.system.clone(),
        messages,
        max_tokens: req
            .max_tokens
            .saturating_sub(used_tokens)
            .max(policy.continuation_floor),
    }
}

/// Drop a prefix of `continuation` that merely repeats the end of `prev`.
fn strip_overlap<'a>(prev: &str, continuation: &'a str) -> &'a str {
    let prev_tail = last_chars(prev, MAX_OVERLAP_CHARS);
    let mut best = 0;
    for (idx, _) in prev_tail.char_indices() {
        let suffix = &prev_tail[idx..];
        // Short overlaps are usually coincidence (a shared space or letter).
        if suffix.chars().count() >= 8 && continuation.starts_with(suffix) {
            best = suffix.len();
            break;
        }
    }
    &continuation[best..]
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::provider::{Completion, CompletionStream};

    /// Provider returning scripted results and recording every request.
    struct Scripted {
        invokes: Mutex<Vec<Result<Completion, ProviderError>>>,
        stream: Mutex<Option<Vec<StreamEvent>>>,
        polled: Arc<AtomicUsize>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(invokes: Vec<Result<Completion, ProviderError>>) -> Self {
            Self {
                invokes: Mutex::new(invokes),
                stream: Mutex::new(None),
                polled: Arc::new(AtomicUsize::new(0)),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with_stream(self, events: Vec<StreamEvent>) -> Self {
            *self.stream.lock().unwrap() = Some(events);
            self
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let mut invokes = self.invokes.lock().unwrap();
            if invokes.is_empty() {
                return Err(ProviderError::Unavailable("script exhausted".into()));
            }
            invokes.remove(0)
        }

        async fn invoke_streaming(
            &self,
            req: &CompletionRequest,
        ) -> Result<CompletionStream, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let events = self
                .stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ProviderError::Unavailable("no stream scripted".into()))?;
            let polled = Arc::clone(&self.polled);
            Ok(Box::pin(futures_util::stream::iter(events).inspect(move |_| {
                polled.fetch_add(1, Ordering::SeqCst);
            })))
        }
    }

    fn completion(text: &str, tokens_out: u32) -> Result<Completion, ProviderError> {
        Ok(Completion {
            text: text.to_string(),
            model: "m".to_string(),
            tokens_in: 10,
            tokens_out,
            stop_reason: "max_tokens".to_string(),
        })
    }

    fn done(tokens_out: u32) -> StreamEvent {
        StreamEvent::Done {
            model: "m".to_string(),
            tokens_in: 10,
            tokens_out,
            stop_reason: "max_tokens".to_string(),
        }
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            text: text.to_string(),
        }
    }

    fn guard(provider: Arc<Scripted>) -> TruncationGuard {
        TruncationGuard::new(
            provider,
            Box::new(TrailingPatternHeuristic::default()),
            TruncationPolicy::default(),
        )
    }

    #[tokio::test]
    async fn dangling_operator_at_high_usage_triggers_one_continuation() {
        let provider = Arc::new(
            Scripted::new(vec![completion(" 42;\n```\nDone.", 120)])
                .with_stream(vec![delta("Here is the code:\n```rust\nlet x ="), done(960)]),
        );
        let guard = guard(Arc::clone(&provider));

        let req = CompletionRequest::prompt("m", "write code", 1000);
        let result = guard.complete(&req, true).await.unwrap();

        assert!(result.declared_truncated);
        assert!(result.continued);
        assert_eq!(result.text, "Here is the code:\n```rust\nlet x = 42;\n```\nDone.");
        assert_eq!(result.used_tokens, 1080);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2, "exactly one continuation request");
        let cont = &requests[1];
        assert_eq!(cont.max_tokens, 1000, "floor applies when little budget remains");
        assert_eq!(cont.messages.len(), 3);
        assert!(cont.messages[1].content.ends_with("let x ="));
    }

    #[tokio::test]
    async fn finished_sentence_at_low_usage_is_not_continued() {
        let provider = Arc::new(Scripted::new(vec![completion("All done here.", 400)]));
        let guard = guard(Arc::clone(&provider));

        let req = CompletionRequest::prompt("m", "q", 1000);
        let result = guard.complete(&req, false).await.unwrap();

        assert!(!result.declared_truncated);
        assert!(!result.continued);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn finished_sentence_at_high_usage_is_not_continued() {
        let provider = Arc::new(Scripted::new(vec![completion("All done here.", 990)]));
        let guard = guard(Arc::clone(&provider));

        let req = CompletionRequest::prompt("m", "q", 1000);
        let result = guard.complete(&req, false).await.unwrap();

        assert!(!result.declared_truncated);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn continuation_budget_uses_remaining_tokens_when_above_floor() {
        let provider = Arc::new(Scripted::new(vec![
            completion("The answer is that", 3900),
            completion(" it works.", 50),
        ]));
        let guard = guard(Arc::clone(&provider));

        let req = CompletionRequest::prompt("m", "q", 4096);
        let result = guard.complete(&req, false).await.unwrap();

        assert!(result.continued);
        assert_eq!(result.text, "The answer is that it works.");
        // 196 tokens left, below the floor.
        assert_eq!(provider.requests()[1].max_tokens, 1000);

        let provider = Arc::new(Scripted::new(vec![
            completion("The answer is that", 38_000),
            completion(" it works.", 50),
        ]));
        let guard = self::guard(Arc::clone(&provider));
        let req = CompletionRequest::prompt("m", "q", 40_000);
        guard.complete(&req, false).await.unwrap();
        assert_eq!(provider.requests()[1].max_tokens, 2000);
    }

    #[tokio::test]
    async fn failed_continuation_returns_original_text() {
        let provider = Arc::new(Scripted::new(vec![
            completion("We should consider the", 980),
            Err(ProviderError::Unavailable("down".into())),
        ]));
        let guard = guard(Arc::clone(&provider));

        let req = CompletionRequest::prompt("m", "q", 1000);
        let result = guard.complete(&req, false).await.unwrap();

        assert!(result.declared_truncated);
        assert!(!result.continued);
        assert_eq!(result.text, "We should consider the");
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn first_call_failure_is_reported() {
        let provider = Arc::new(Scripted::new(vec![Err(ProviderError::Unavailable(
            "down".into(),
        ))]));
        let guard = guard(provider);
        let req = CompletionRequest::prompt("m", "q", 1000);
        assert!(guard.complete(&req, false).await.is_err());
    }

    #[tokio::test]
    async fn streaming_stops_at_ceiling_without_draining() {
        let chunk = "x".repeat(1000);
        let mut events: Vec<StreamEvent> = (0..60).map(|_| delta(&chunk)).collect();
        events.push(done(5000));
        let provider = Arc::new(Scripted::new(vec![]).with_stream(events));
        let guard = TruncationGuard::new(
            Arc::clone(&provider) as Arc<dyn CompletionProvider>,
            Box::new(TrailingPatternHeuristic::default()),
            TruncationPolicy {
                ceiling_chars: 45_000,
                ..TruncationPolicy::default()
            },
        );

        let req = CompletionRequest::prompt("m", "q", 1000);
        let result = guard.complete(&req, true).await.unwrap();

        assert!(result.ceiling_hit);
        assert!(!result.continued);
        assert_eq!(result.text.chars().count(), 45_000);
        assert_eq!(provider.polled.load(Ordering::SeqCst), 45);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn stream_error_before_any_text_is_a_provider_error() {
        let provider = Arc::new(Scripted::new(vec![]).with_stream(vec![StreamEvent::Error {
            message: "overloaded".into(),
        }]));
        let guard = guard(provider);
        let req = CompletionRequest::prompt("m", "q", 1000);
        assert!(matches!(
            guard.complete(&req, true).await,
            Err(ProviderError::Stream(_))
        ));
    }

    #[test]
    fn heuristic_flags_dangling_operator() {
        let h = TrailingPatternHeuristic::default();
        let s = h.signals("let total = x =");
        assert!(s.dangling_tail);
        assert!(s.missing_terminal);
    }

    #[test]
    fn heuristic_flags_unbalanced_fence() {
        let h = TrailingPatternHeuristic::default();
        let s = h.signals("Example:\n```python\nprint('hi')\n");
        assert!(s.unbalanced_fence);
    }

    #[test]
    fn heuristic_accepts_closed_fence() {
        let h = TrailingPatternHeuristic::default();
        assert!(!h.looks_incomplete("Example:\n```python\nprint('hi')\n```"));
    }

    #[test]
    fn heuristic_accepts_terminal_punctuation_and_markup() {
        let h = TrailingPatternHeuristic::default();
        assert!(!h.looks_incomplete("That is all."));
        assert!(!h.looks_incomplete("这就是答案。"));
        assert!(!h.looks_incomplete("**Finished!**  \n"));
    }

    #[test]
    fn heuristic_flags_connectives() {
        let h = TrailingPatternHeuristic::default();
        assert!(h.looks_incomplete("We compared the results and"));
        assert!(h.signals("结果很好，因为").dangling_tail);
        assert!(h.signals("Items:").dangling_tail);
    }

    #[test]
    fn heuristic_ignores_empty_text() {
        assert!(!TrailingPatternHeuristic::default().looks_incomplete("   "));
    }

    #[test]
    fn overlap_is_trimmed() {
        let prev = "The quick brown fox jumps over";
        assert_eq!(strip_overlap(prev, "fox jumps over the lazy dog."), " the lazy dog.");
        assert_eq!(strip_overlap(prev, " the lazy dog."), " the lazy dog.");
    }

    #[test]
    fn last_chars_respects_char_boundaries() {
        assert_eq!(last_chars("héllo wörld", 5), "wörld");
        assert_eq!(last_chars("ab", 50), "ab");
    }
}
