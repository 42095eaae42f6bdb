//! Lark / Feishu open-platform adapters: API client, message sending and
//! editing, thread history, and inbound event decoding.

pub mod card;
pub mod client;
pub mod context;
pub mod error;
pub mod event;
pub mod send;

pub use client::LarkClient;
pub use context::LarkContext;
pub use error::LarkError;
pub use event::{classify, Callback};
pub use send::LarkGateway;
