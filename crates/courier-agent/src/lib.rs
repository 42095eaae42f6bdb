pub mod anthropic;
pub mod anthropic_stream;
pub mod provider;
pub mod stream;
pub mod truncation;

pub use anthropic::AnthropicProvider;
pub use provider::{Completion, CompletionProvider, CompletionRequest, Message, ProviderError};
pub use truncation::{CompletionResult, TrailingPatternHeuristic, TruncationGuard, TruncationPolicy};
