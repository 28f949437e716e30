//! OpenAI-compatible chat completions transport.
//!
//! Works against any provider exposing `POST {base_url}/chat/completions`
//! (Deepseek, OpenAI, vLLM, ...). Streaming responses are read as
//! server-sent events until `data: [DONE]`.
//!
//! # Example
//!
//! ```rust,ignore
//! use recruit_llm::{ChatRequest, ChatTransport, LlmConfig, OpenAiCompatClient};
//!
//! let config = LlmConfig::new("https://api.deepseek.com", "sk-...", "deepseek-chat");
//! let transport = OpenAiCompatClient::new(&config)?;
//!
//! let response = transport.send(&ChatRequest::prompt("You are terse.", "Hello!")).await?;
//! println!("{}", response.content);
//! ```

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::request::{ChatMessage, ChatRequest, ChatResponse, TokenStream, Usage};
use crate::transport::ChatTransport;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// HTTP transport for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatClient {
    /// Create a transport from configuration.
    ///
    /// The per-call timeout is enforced by [`crate::LlmClient`]; the HTTP client
    /// only gets a connect timeout so streamed responses are not cut off.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> WireRequest<'a> {
        WireRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages: &request.messages,
            temperature: request.temperature.unwrap_or(self.temperature),
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
            stream,
        }
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::Auth("no API key configured".to_string()));
        }

        let body = self.build_body(request, stream);
        debug!(
            model = body.model,
            messages = request.messages.len(),
            stream,
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }
}

#[async_trait]
impl ChatTransport for OpenAiCompatClient {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post(request, false).await?;
        let text = response.text().await?;
        parse_completion(&text)
    }

    async fn send_stream(&self, request: &ChatRequest) -> Result<TokenStream> {
        let response = self.post(request, true).await?;
        Ok(Box::pin(sse_deltas(response.bytes_stream())))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

/// Turn a raw SSE byte stream into content deltas.
///
/// Lines may be split across chunks (including inside a UTF-8 sequence); they
/// are buffered until a newline arrives. The stream ends at `[DONE]` or EOF.
pub fn sse_deltas<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<LlmError> + Send,
{
    async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| -> LlmError { e.into() })?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = std::str::from_utf8(&line).map_err(|e| {
                    LlmError::InvalidResponse(format!("invalid UTF-8 in stream: {}", e))
                })?;

                match parse_sse_line(line)? {
                    SseEvent::Delta(delta) => {
                        yield delta;
                    }
                    SseEvent::Done => break 'read,
                    SseEvent::Skip => {}
                }
            }
        }

        if !buffer.is_empty() {
            let tail = String::from_utf8_lossy(&buffer).into_owned();
            if let SseEvent::Delta(delta) = parse_sse_line(&tail)? {
                yield delta;
            }
        }
    }
}

/// Map a non-success HTTP status to an error classification.
pub fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let body = truncate(body, MAX_ERROR_BODY);
    let message = format!("HTTP {}: {}", status.as_u16(), body);

    match status.as_u16() {
        401 | 403 => LlmError::Auth(message),
        429 => LlmError::RateLimited(message),
        408 => LlmError::Transport(message),
        code if code >= 500 => LlmError::Transport(message),
        _ => LlmError::InvalidResponse(message),
    }
}

/// Parse a non-streamed completion body.
pub fn parse_completion(body: &str) -> Result<ChatResponse> {
    let wire: WireResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "failed to parse completion: {} (body: {})",
            e,
            truncate(body, 200)
        ))
    })?;

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("completion has no choices".to_string()))?;

    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        return Err(LlmError::InvalidResponse(
            "completion content is empty".to_string(),
        ));
    }

    Ok(ChatResponse {
        content,
        model: wire.model.unwrap_or_default(),
        usage: wire.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        finish_reason: choice.finish_reason,
    })
}

/// One decoded server-sent-event line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Decode a single SSE line.
///
/// Blank lines, comments, non-data fields and empty deltas are `Skip`.
pub fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let chunk: WireChunk = serde_json::from_str(data).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "failed to parse stream chunk: {} (data: {})",
            e,
            truncate(data, 200)
        ))
    })?;

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();

    if delta.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Delta(delta))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// Wire types
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}
