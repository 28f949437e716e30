//! Gated, retrying LLM client.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::gate::{deadline_after, GateStatus, RateLimitedGate};
use crate::openai::OpenAiCompatClient;
use crate::request::{ChatRequest, ChatResponse, TokenStream};
use crate::retry::retry_with_backoff;
use crate::transport::ChatTransport;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration and counters reported by [`LlmClient::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmStatus {
    pub model: String,
    pub base_url: String,
    pub api_key_configured: bool,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub gate: GateStatus,
}

/// LLM client used by every pipeline step.
///
/// Each attempt takes a permit from the shared [`RateLimitedGate`], runs under
/// the per-call timeout, and gives the permit back before any backoff sleep.
/// Transient failures are retried per the configured [`crate::RetryConfig`].
#[derive(Clone)]
pub struct LlmClient {
    transport: Arc<dyn ChatTransport>,
    gate: Arc<RateLimitedGate>,
    config: Arc<LlmConfig>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("transport", &self.transport.name())
            .field("model", &self.config.model)
            .field("gate", &self.gate)
            .finish()
    }
}

impl LlmClient {
    /// Client over the OpenAI-compatible HTTP transport, sharing `gate`.
    pub fn new(config: LlmConfig, gate: Arc<RateLimitedGate>) -> Result<Self> {
        let transport = OpenAiCompatClient::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport), gate))
    }

    /// Client over the OpenAI-compatible transport with its own gate built from `config`.
    pub fn from_config(config: LlmConfig) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(RateLimitedGate::new(
            config.max_concurrency,
            config.requests_per_minute,
            config.acquire_timeout(),
        ));
        Self::new(config, gate)
    }

    /// Client over an arbitrary transport.
    pub fn with_transport(
        config: LlmConfig,
        transport: Arc<dyn ChatTransport>,
        gate: Arc<RateLimitedGate>,
    ) -> Self {
        Self {
            transport,
            gate,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<RateLimitedGate> {
        &self.gate
    }

    /// Whether an API key is configured.
    pub fn is_configured(&self) -> bool {
        self.config.has_api_key()
    }

    pub fn status(&self) -> LlmStatus {
        LlmStatus {
            model: self.config.model.clone(),
            base_url: self.config.base_url.clone(),
            api_key_configured: self.is_configured(),
            temperature: self.config.temperature,
            timeout_secs: self.config.timeout_secs,
            max_retries: self.config.retry.max_retries,
            gate: self.gate.status(),
        }
    }

    /// Send a request and wait for the full response.
    pub async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse> {
        let transport = &self.transport;
        let gate = &self.gate;
        let request = &request;
        let timeout = self.config.timeout();

        let response = retry_with_backoff(&self.config.retry, "llm_invoke", move || async move {
            let _permit = gate.acquire().await?;
            match tokio::time::timeout(timeout, transport.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(call_timeout(timeout)),
            }
        })
        .await?;

        debug!(
            model = %response.model,
            chars = response.content.len(),
            "LLM call completed"
        );
        Ok(response)
    }

    /// Send a request and receive the response as content deltas.
    ///
    /// Opening the stream is retried like [`LlmClient::invoke`]. Once open, the
    /// permit is held until the stream is dropped and mid-stream failures are
    /// not retried. The per-call timeout bounds the whole attempt, from
    /// opening the stream to its last chunk.
    pub async fn invoke_stream(&self, request: ChatRequest) -> Result<TokenStream> {
        let transport = &self.transport;
        let gate = &self.gate;
        let request = &request;
        let timeout = self.config.timeout();

        let (permit, deadline, inner) =
            retry_with_backoff(&self.config.retry, "llm_invoke_stream", move || async move {
                let permit = gate.acquire().await?;
                let deadline = deadline_after(Instant::now(), timeout);
                match tokio::time::timeout_at(deadline, transport.send_stream(request)).await {
                    Ok(Ok(stream)) => Ok((permit, deadline, stream)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(call_timeout(timeout)),
                }
            })
            .await?;

        let stream = async_stream::try_stream! {
            let _permit = permit;
            let mut inner = inner;
            loop {
                match tokio::time::timeout_at(deadline, inner.next()).await {
                    Ok(Some(delta)) => {
                        let delta = delta?;
                        yield delta;
                    }
                    Ok(None) => break,
                    Err(_) => Err::<(), LlmError>(LlmError::Timeout(format!(
                        "stream not finished within {}s",
                        timeout.as_secs()
                    )))?,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Single-turn completion returning the trimmed text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let response = self.invoke(ChatRequest::prompt(system, user)).await?;
        Ok(response.content.trim().to_string())
    }

    /// Single-turn completion consumed as a stream and concatenated.
    pub async fn complete_streamed(&self, system: &str, user: &str) -> Result<String> {
        let mut stream = self.invoke_stream(ChatRequest::prompt(system, user)).await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta?);
        }

        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse(
                "streamed completion is empty".to_string(),
            ));
        }
        Ok(text.trim().to_string())
    }

    /// Single-turn completion parsed as a JSON object.
    pub async fn complete_json(
        &self,
        system: &str,
        user: &str,
        temperature: Option<f32>,
    ) -> Result<Value> {
        let mut request = ChatRequest::prompt(system, user).with_json_mode();
        if let Some(temperature) = temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.invoke(request).await?;
        let value = parse_json_block(&response.content)?;
        info!(model = %response.model, "Structured LLM response parsed");
        Ok(value)
    }
}

fn call_timeout(timeout: Duration) -> LlmError {
    LlmError::Timeout(format!("no response within {}s", timeout.as_secs()))
}

/// Extract a JSON object from model output.
///
/// Accepts a bare object, a ```json fenced block, a plain ``` fence, or the
/// outermost `{...}` span of surrounding prose.
pub fn parse_json_block(text: &str) -> Result<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    for fence in ["```json", "```JSON", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let body = &trimmed[start + fence.len()..];
            let body = match body.find("```") {
                Some(end) => &body[..end],
                None => body,
            };
            if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(LlmError::InvalidResponse(format!(
        "response is not a JSON object: {}",
        preview
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TokenStream;
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Transport that replays scripted outcomes and counts calls.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<usize>,
        delay: Duration,
        chunk_delay: Duration,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
                chunk_delay: Duration::ZERO,
            })
        }

        /// Streams `content` word by word, one word every `chunk_delay`
        fn trickling(content: &str, chunk_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::from(vec![Ok(content.to_string())])),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
                chunk_delay,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                calls: Mutex::new(0),
                delay,
                chunk_delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }

        fn next(&self) -> Result<String> {
            *self.calls.lock() += 1;
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("default".to_string()))
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            let outcome = self.next();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            outcome.map(|content| ChatResponse::new(content, "mock"))
        }

        async fn send_stream(&self, _request: &ChatRequest) -> Result<TokenStream> {
            let content = self.next()?;
            let parts: Vec<Result<String>> = content
                .split_inclusive(' ')
                .map(|p| Ok(p.to_string()))
                .collect();
            let chunk_delay = self.chunk_delay;
            Ok(Box::pin(futures::stream::iter(parts).then(move |part| async move {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                part
            })))
        }
    }

    fn client_with(transport: Arc<ScriptedTransport>, max_retries: u32) -> LlmClient {
        let config = LlmConfig::new("http://mock", "sk-test", "mock").with_retry(
            RetryConfig::new(max_retries)
                .with_initial_backoff(1)
                .with_jitter(false),
        );
        let gate = Arc::new(RateLimitedGate::new(2, 10_000, Duration::from_secs(5)));
        LlmClient::with_transport(config, transport, gate)
    }

    #[tokio::test]
    async fn test_retries_exactly_configured_times_then_classifies() {
        let transport = ScriptedTransport::new(vec![
            Err(LlmError::Transport("503".into())),
            Err(LlmError::Transport("503".into())),
            Err(LlmError::Transport("503".into())),
            Err(LlmError::Transport("503".into())),
        ]);
        let client = client_with(Arc::clone(&transport), 3);

        let result = client.invoke(ChatRequest::prompt("s", "u")).await;

        assert!(matches!(result, Err(LlmError::Transport(_))));
        assert_eq!(transport.calls(), 4);
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(LlmError::Auth("401".into()))]);
        let client = client_with(Arc::clone(&transport), 3);

        let result = client.invoke(ChatRequest::prompt("s", "u")).await;

        assert_eq!(result.unwrap_err().kind(), crate::LlmErrorKind::LlmAuthError);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let transport = ScriptedTransport::new(vec![
            Err(LlmError::RateLimited("429".into())),
            Ok("hello".into()),
        ]);
        let client = client_with(Arc::clone(&transport), 3);

        let text = client.complete("s", "u").await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_classified() {
        let transport = ScriptedTransport::slow(Duration::from_secs(500));
        let client = client_with(Arc::clone(&transport), 1);

        let result = client.invoke(ChatRequest::prompt("s", "u")).await;

        assert!(matches!(result, Err(LlmError::Timeout(_))));
        assert_eq!(transport.calls(), 2);
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_complete_json_parses_fenced_output() {
        let transport = ScriptedTransport::new(vec![Ok(
            "Here you go:\n```json\n{\"score\": 4}\n```".into(),
        )]);
        let client = client_with(transport, 0);

        let value = client.complete_json("s", "u", Some(0.2)).await.unwrap();
        assert_eq!(value, json!({"score": 4}));
    }

    #[tokio::test]
    async fn test_stream_holds_permit_until_dropped() {
        let transport = ScriptedTransport::new(vec![Ok("one two three".into())]);
        let client = client_with(transport, 0);

        let mut stream = client
            .invoke_stream(ChatRequest::prompt("s", "u"))
            .await
            .unwrap();
        assert_eq!(client.gate().available_permits(), 1);

        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta.unwrap());
        }
        drop(stream);

        assert_eq!(text, "one two three");
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invoke_releases_permit() {
        let transport = ScriptedTransport::slow(Duration::from_secs(60));
        let client = client_with(Arc::clone(&transport), 0);

        let mut call = Box::pin(client.invoke(ChatRequest::prompt("s", "u")));
        let pending = tokio::time::timeout(Duration::from_secs(1), &mut call).await;
        assert!(pending.is_err());
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.gate().available_permits(), 1);

        drop(call);
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_stream_open_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(LlmError::Transport("connection reset".into())),
            Ok("retried stream".into()),
        ]);
        let client = client_with(Arc::clone(&transport), 2);

        let text = client.complete_streamed("s", "u").await.unwrap();

        assert_eq!(text, "retried stream");
        assert_eq!(transport.calls(), 2);
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_stream_open_auth_failure_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(LlmError::Auth("401".into()))]);
        let client = client_with(Arc::clone(&transport), 3);

        let result = client.complete_streamed("s", "u").await;

        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickling_stream_hits_call_timeout() {
        // 120s per call; one word every 50s never stalls a single chunk
        // for longer than the timeout, but the whole stream takes 200s.
        let transport = ScriptedTransport::trickling("a b c d", Duration::from_secs(50));
        let client = client_with(Arc::clone(&transport), 3);

        let mut stream = client
            .invoke_stream(ChatRequest::prompt("s", "u"))
            .await
            .unwrap();
        let mut received = Vec::new();
        let mut failure = None;
        while let Some(delta) = stream.next().await {
            match delta {
                Ok(text) => received.push(text),
                Err(err) => failure = Some(err),
            }
        }
        drop(stream);

        assert_eq!(received, vec!["a ", "b "]);
        assert!(matches!(failure, Some(LlmError::Timeout(_))));
        // Mid-stream failures are not retried
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.gate().available_permits(), 2);
    }

    #[tokio::test]
    async fn test_complete_streamed_rejects_empty() {
        let transport = ScriptedTransport::new(vec![Ok("   ".into())]);
        let client = client_with(transport, 0);

        let result = client.complete_streamed("s", "u").await;
        assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_json_block_variants() {
        assert_eq!(parse_json_block(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_json_block("```JSON\n{\"a\": 2}\n```").unwrap(),
            json!({"a": 2})
        );
        assert_eq!(parse_json_block("```\n{\"a\": 3}\n```").unwrap(), json!({"a": 3}));
        assert_eq!(
            parse_json_block("Result: {\"a\": {\"b\": 4}} done").unwrap(),
            json!({"a": {"b": 4}})
        );
    }

    #[test]
    fn test_parse_json_block_rejects_non_objects() {
        assert!(matches!(
            parse_json_block("no json here"),
            Err(LlmError::InvalidResponse(_))
        ));
        assert!(parse_json_block("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_status_reports_configuration() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client_with(transport, 2);

        let status = client.status();
        assert!(status.api_key_configured);
        assert_eq!(status.model, "mock");
        assert_eq!(status.max_retries, 2);
        assert_eq!(status.gate.max_concurrency, 2);
    }
}
