//! The seam between [`crate::LlmClient`] and the wire.

use crate::error::Result;
use crate::request::{ChatRequest, ChatResponse, TokenStream};
use async_trait::async_trait;

/// Sends a single chat request to a provider.
///
/// Implementations perform exactly one attempt and classify their failures
/// into [`crate::LlmError`]; gating, timeouts and retries are layered on top
/// by [`crate::LlmClient`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a request and wait for the complete response.
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Send a request and return the response as a stream of content deltas.
    ///
    /// An error returned here means the stream could not be opened; errors
    /// after that arrive as stream items.
    async fn send_stream(&self, request: &ChatRequest) -> Result<TokenStream>;

    /// Human-readable transport name for logs.
    fn name(&self) -> &str {
        "chat"
    }
}
