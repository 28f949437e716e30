//! Shared fixtures: a scripted chat transport and supervisor wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use recruit_llm::{
    ChatRequest, ChatResponse, ChatTransport, LlmClient, LlmConfig, LlmError, RateLimitedGate,
    RetryConfig, TokenStream,
};
use recruit_orchestrator::{
    InMemoryTaskStore, ProgressView, TaskIdentity, TaskSupervisor, ViewStatus,
};
use std::sync::Arc;
use std::time::Duration;

/// Chat transport answering with a fixed reply after an optional delay.
///
/// Counts calls and the highest number of calls in flight at once.
pub struct MockTransport {
    reply: Result<String, LlmError>,
    delay: Duration,
    pub calls: Mutex<usize>,
    in_flight: Mutex<usize>,
    pub max_in_flight: Mutex<usize>,
}

impl MockTransport {
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Self::build(Ok(reply.into()), Duration::ZERO)
    }

    pub fn failing(error: LlmError) -> Arc<Self> {
        Self::build(Err(error), Duration::ZERO)
    }

    pub fn slow(reply: impl Into<String>, delay: Duration) -> Arc<Self> {
        Self::build(Ok(reply.into()), delay)
    }

    fn build(reply: Result<String, LlmError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: Mutex::new(0),
            in_flight: Mutex::new(0),
            max_in_flight: Mutex::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }

    async fn answer(&self) -> Result<String, LlmError> {
        *self.calls.lock() += 1;
        {
            let mut in_flight = self.in_flight.lock();
            *in_flight += 1;
            let mut max = self.max_in_flight.lock();
            *max = (*max).max(*in_flight);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        *self.in_flight.lock() -= 1;
        self.reply.clone()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.answer().await.map(|c| ChatResponse::new(c, "mock"))
    }

    async fn send_stream(&self, _request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let content = self.answer().await?;
        let chunks: Vec<Result<String, LlmError>> = content
            .chars()
            .collect::<Vec<_>>()
            .chunks(32)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// LLM client over `transport` with a fresh gate of `max_concurrency` slots
pub fn llm_client(transport: Arc<MockTransport>, max_concurrency: usize, retries: u32) -> LlmClient {
    let config = LlmConfig::new("http://mock", "sk-test", "mock-model").with_retry(
        RetryConfig::new(retries)
            .with_initial_backoff(100)
            .with_jitter(false),
    );
    let gate = Arc::new(RateLimitedGate::new(
        max_concurrency,
        10_000,
        Duration::from_secs(60),
    ));
    LlmClient::with_transport(config, transport, gate)
}

pub fn supervisor(llm: LlmClient, store: &Arc<InMemoryTaskStore>, workers: usize) -> TaskSupervisor {
    TaskSupervisor::builder(llm, store.clone(), store.clone())
        .workers(workers)
        .start()
}

/// Poll until the task is terminal and its identity released
pub async fn wait_terminal(supervisor: &TaskSupervisor, identity: &TaskIdentity) -> ProgressView {
    for _ in 0..10_000 {
        let view = supervisor
            .status(identity)
            .await
            .expect("task should be known");
        if matches!(view.status, ViewStatus::Succeeded | ViewStatus::Failed)
            && !supervisor.is_active(identity)
        {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {} did not finish", identity);
}
