use figment::{
    providers::{Env, Format, Toml},
    value::Uncased,
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::PayloadKind;

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_LARK_BASE_URL: &str = "https://open.feishu.cn";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Unprefixed legacy environment variables, mapped onto config paths.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("APP_ID", "lark.app_id"),
    ("APP_SECRET", "lark.app_secret"),
    ("BASE_DOMAIN", "lark.base_url"),
    ("BOT_OPEN_ID", "lark.bot.open_id"),
    ("BOT_USER_ID", "lark.bot.user_id"),
    ("APP_NAME", "lark.bot.app_name"),
    ("ANTHROPIC_BASE_URL", "provider.base_url"),
    ("ANTHROPIC_AUTH_TOKEN", "provider.auth_token"),
];

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lark: LarkConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub truncation: TruncationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub ack: AckConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Lark / Feishu application credentials and bot identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LarkConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Open platform domain, e.g. https://open.feishu.cn or https://open.larksuite.com.
    #[serde(default = "default_lark_base_url")]
    pub base_url: String,
    /// Token echoed in every event body; checked when set.
    pub verification_token: Option<String>,
    /// Must stay unset: with an Encrypt Key, Lark encrypts every callback body.
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub bot: BotIdentity,
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            base_url: default_lark_base_url(),
            verification_token: None,
            encrypt_key: None,
            bot: BotIdentity::default(),
        }
    }
}

/// How the bot recognises that it was mentioned in a group chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotIdentity {
    pub open_id: Option<String>,
    pub user_id: Option<String>,
    /// Display name of the app; matched exactly against mention names.
    pub app_name: Option<String>,
    /// Last-resort substrings matched against mention names.
    #[serde(default = "default_mention_keywords")]
    pub mention_keywords: Vec<String>,
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self {
            open_id: None,
            user_id: None,
            app_name: None,
            mention_keywords: default_mention_keywords(),
        }
    }
}

/// Anthropic-compatible Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Token budget requested for every completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Use the SSE streaming endpoint.
    #[serde(default = "bool_true")]
    pub streaming: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_base_url(),
            auth_token: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            streaming: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Number of prior thread messages fetched for each task.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    /// Period of the background sweep; defaults to the TTL.
    #[serde(default = "default_dedup_ttl_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            sweep_interval_secs: default_dedup_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Consecutive failures that pause the worker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationConfig {
    /// Streaming stops once this many characters have been accumulated.
    #[serde(default = "default_stream_ceiling_chars")]
    pub stream_ceiling_chars: usize,
    /// Fraction of the token budget at which a result counts as exhausted.
    #[serde(default = "default_usage_ratio")]
    pub usage_ratio: f64,
    /// Characters inspected at the end of the text.
    #[serde(default = "default_trailing_window")]
    pub trailing_window: usize,
    /// Minimum token budget for the continuation request.
    #[serde(default = "default_continuation_floor")]
    pub continuation_floor_tokens: u32,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            stream_ceiling_chars: default_stream_ceiling_chars(),
            usage_ratio: default_usage_ratio(),
            trailing_window: default_trailing_window(),
            continuation_floor_tokens: default_continuation_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_text_max_bytes")]
    pub text_max_bytes: usize,
    #[serde(default = "default_card_max_bytes")]
    pub card_max_bytes: usize,
    /// Preferred segment length in characters.
    #[serde(default = "default_chunk_target_chars")]
    pub chunk_target_chars: usize,
    /// Hard byte cap for one segment's text.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: usize,
    /// How far back (in bytes) to search for a clean break point.
    #[serde(default = "default_lookback_bytes")]
    pub lookback_bytes: usize,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    #[serde(default = "default_inter_send_delay_ms")]
    pub inter_send_delay_ms: u64,
    /// Payload kind used for segments sent as new messages.
    #[serde(default = "default_segment_payload")]
    pub segment_payload: PayloadKind,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            text_max_bytes: default_text_max_bytes(),
            card_max_bytes: default_card_max_bytes(),
            chunk_target_chars: default_chunk_target_chars(),
            segment_max_bytes: default_segment_max_bytes(),
            lookback_bytes: default_lookback_bytes(),
            max_segments: default_max_segments(),
            inter_send_delay_ms: default_inter_send_delay_ms(),
            segment_payload: default_segment_payload(),
        }
    }
}

impl DeliveryConfig {
    /// Maximum rendered byte size for a payload kind.
    pub fn limit_for(&self, kind: PayloadKind) -> usize {
        match kind {
            PayloadKind::Text => self.text_max_bytes,
            PayloadKind::Card => self.card_max_bytes,
        }
    }
}

/// The early "processing" acknowledgement that later becomes the placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_ack_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ack_text")]
    pub text: String,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_ack_timeout_ms(),
            text: default_ack_text(),
        }
    }
}

/// Reply formatting and canned user-visible texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Ask the model to show its reasoning and mark the final answer.
    #[serde(default)]
    pub deep_thinking: bool,
    #[serde(default = "default_standard_prefix")]
    pub standard_prefix: String,
    #[serde(default = "default_deep_thinking_prefix")]
    pub deep_thinking_prefix: String,
    #[serde(default = "default_deep_thinking_suffix")]
    pub deep_thinking_suffix: String,
    #[serde(default = "default_deep_thinking_prompt")]
    pub deep_thinking_prompt: String,
    #[serde(default = "default_apology")]
    pub apology: String,
    #[serde(default = "default_parse_failure")]
    pub parse_failure: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            deep_thinking: false,
            standard_prefix: default_standard_prefix(),
            deep_thinking_prefix: default_deep_thinking_prefix(),
            deep_thinking_suffix: default_deep_thinking_suffix(),
            deep_thinking_prompt: default_deep_thinking_prompt(),
            apology: default_apology(),
            parse_failure: default_parse_failure(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_lark_base_url() -> String {
    DEFAULT_LARK_BASE_URL.to_string()
}
fn default_anthropic_base_url() -> String {
    DEFAULT_ANTHROPIC_BASE_URL.to_string()
}
fn default_mention_keywords() -> Vec<String> {
    vec!["机器人".to_string(), "Bot".to_string(), "Assistant".to_string()]
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_history_limit() -> usize {
    10
}
fn default_dedup_ttl_secs() -> u64 {
    300
}
fn default_failure_threshold() -> u32 {
    10
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_stream_ceiling_chars() -> usize {
    45_000
}
fn default_usage_ratio() -> f64 {
    0.95
}
fn default_trailing_window() -> usize {
    50
}
fn default_continuation_floor() -> u32 {
    1000
}
fn default_text_max_bytes() -> usize {
    150_000
}
fn default_card_max_bytes() -> usize {
    30_000
}
fn default_chunk_target_chars() -> usize {
    20_000
}
fn default_segment_max_bytes() -> usize {
    30_000
}
fn default_lookback_bytes() -> usize {
    2_000
}
fn default_max_segments() -> usize {
    10
}
fn default_inter_send_delay_ms() -> u64 {
    200
}
fn default_segment_payload() -> PayloadKind {
    PayloadKind::Card
}
fn default_ack_timeout_ms() -> u64 {
    3_000
}
fn default_ack_text() -> String {
    "🧠 **Thinking...**\n\n⏳ Analysing your question, the full reply will replace this message."
        .to_string()
}
fn default_standard_prefix() -> String {
    "🤖 **AI reply**".to_string()
}
fn default_deep_thinking_prefix() -> String {
    "🧠 **AI deep-thinking reply**".to_string()
}
fn default_deep_thinking_suffix() -> String {
    "\n✨ *Generated in deep-thinking mode*".to_string()
}
fn default_deep_thinking_prompt() -> String {
    "You are an assistant with deep reasoning skills. Before answering, analyse the \
     question carefully and show your thinking:\n\
     1. Understand the core of the question and its background.\n\
     2. Identify the key points and possible solutions.\n\
     3. Reason step by step.\n\
     4. Consider other angles.\n\
     5. Give a well-considered final answer.\n\
     Mark your reasoning with [Thinking] and the final answer with [Answer]."
        .to_string()
}
fn default_apology() -> String {
    "Sorry, the AI service is temporarily unavailable. Please try again later.".to_string()
}
fn default_parse_failure() -> String {
    "解析消息失败，请发送文本消息 \nparse message failed, please send text message".to_string()
}

impl CourierConfig {
    /// Load config from a TOML file with environment overrides.
    ///
    /// Precedence (lowest first): defaults, the TOML file, the legacy
    /// raw variables (`APP_ID`, `ANTHROPIC_AUTH_TOKEN`, ...), `COURIER_*`
    /// variables nested with `__` (e.g. `COURIER_QUEUE__COOLDOWN_SECS=60`).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading config");

        let config: CourierConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(legacy_env())
            .merge(Env::prefixed("COURIER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CourierError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CourierError::Config;

        if self.lark.app_id.is_empty() || self.lark.app_secret.is_empty() {
            return Err(Config("lark.app_id and lark.app_secret are required".into()));
        }
        if self.lark.encrypt_key.as_deref().is_some_and(|k| !k.is_empty()) {
            return Err(Config(
                "lark.encrypt_key is set but encrypted event callbacks are not supported; \
                 clear the Encrypt Key in the app console and unset it here"
                    .into(),
            ));
        }
        if self.provider.auth_token.is_empty() {
            return Err(Config("provider.auth_token is required".into()));
        }
        if self.provider.max_tokens == 0 {
            return Err(Config("provider.max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.truncation.usage_ratio) {
            return Err(Config("truncation.usage_ratio must be within 0..=1".into()));
        }
        let d = &self.delivery;
        if d.max_segments == 0 || d.chunk_target_chars == 0 {
            return Err(Config(
                "delivery.max_segments and delivery.chunk_target_chars must be positive".into(),
            ));
        }
        if d.segment_max_bytes > d.limit_for(d.segment_payload) {
            return Err(Config(format!(
                "delivery.segment_max_bytes ({}) exceeds the {} payload limit ({})",
                d.segment_max_bytes,
                d.segment_payload,
                d.limit_for(d.segment_payload)
            )));
        }
        if self.queue.failure_threshold == 0 {
            return Err(Config("queue.failure_threshold must be positive".into()));
        }
        Ok(())
    }
}

fn legacy_env() -> Env {
    Env::raw()
        .only(&LEGACY_ENV.iter().map(|(k, _)| *k).collect::<Vec<_>>())
        .map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
                .map(|(_, path)| Uncased::from(*path))
                .unwrap_or_else(|| Uncased::from(key.as_str()))
        })
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.courier/courier.toml", home)
}
