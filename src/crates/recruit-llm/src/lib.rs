//! Rate-limited, retrying LLM client for the recruitment pipelines.
//!
//! Every LLM call in the process goes through one shared [`RateLimitedGate`],
//! which bounds in-flight calls and the rate at which new calls start.
//! [`LlmClient`] layers the per-call timeout, retry with exponential backoff,
//! and error classification on top of a [`ChatTransport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use recruit_llm::{LlmClient, LlmConfig, RateLimitedGate};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> recruit_llm::Result<()> {
//!     let config = LlmConfig::new("https://api.deepseek.com", "sk-...", "deepseek-chat");
//!     let gate = Arc::new(RateLimitedGate::new(
//!         config.max_concurrency,
//!         config.requests_per_minute,
//!         config.acquire_timeout(),
//!     ));
//!     let client = LlmClient::new(config, gate)?;
//!
//!     let summary = client
//!         .complete("You are an HR assistant.", "Summarise this résumé: ...")
//!         .await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod openai;
pub mod request;
pub mod retry;
pub mod transport;

pub use client::{parse_json_block, LlmClient, LlmStatus};
pub use config::LlmConfig;
pub use error::{LlmError, LlmErrorKind, Result};
pub use gate::{deadline_after, GatePermit, GateStatus, RateLimitedGate};
pub use openai::OpenAiCompatClient;
pub use request::{ChatMessage, ChatRequest, ChatResponse, Role, TokenStream, Usage};
pub use retry::{backoff_delay, retry_with_backoff, RetryConfig};
pub use transport::ChatTransport;
