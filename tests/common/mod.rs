//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use envoy_core::{Coordinator, LocalModelMatcher};
use envoy_ledger::UsageLedger;
use envoy_providers::{
    GenerateFut, GenerateRequest, Generation, ModelHandle, ModelProvider, ProviderError, TokenUsage,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Tracks how many generations are in flight at once.
#[derive(Debug, Default)]
pub struct OverlapCounter {
    inside: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl OverlapCounter {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A model that sleeps, then echoes its prompt with fixed usage.
pub struct SlowEcho {
    model: String,
    delay: Duration,
    counter: Arc<OverlapCounter>,
}

impl ModelHandle for SlowEcho {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn generate<'a>(&'a self, prompt: &'a str, _request: &'a GenerateRequest) -> GenerateFut<'a> {
        Box::pin(async move {
            self.counter.enter();
            tokio::time::sleep(self.delay).await;
            self.counter.exit();
            Ok(Generation::new(
                self.model.clone(),
                format!("{}: {prompt}", self.model),
                Some(TokenUsage::new(prompt.len() as u64, 5)),
            ))
        })
    }
}

/// Resolves every id into a [`SlowEcho`] sharing one counter.
pub struct SlowEchoProvider {
    pub delay: Duration,
    pub counter: Arc<OverlapCounter>,
}

impl SlowEchoProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            counter: Arc::new(OverlapCounter::default()),
        }
    }
}

impl ModelProvider for SlowEchoProvider {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        if model_id.starts_with("missing/") {
            return Err(ProviderError::unknown_model(model_id));
        }
        Ok(Arc::new(SlowEcho {
            model: model_id.to_string(),
            delay: self.delay,
            counter: Arc::clone(&self.counter),
        }))
    }
}

/// A model that answers every prompt with the same text.
pub struct FixedReply {
    model: String,
    reply: String,
    usage: Option<TokenUsage>,
}

impl ModelHandle for FixedReply {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn generate<'a>(&'a self, _prompt: &'a str, _request: &'a GenerateRequest) -> GenerateFut<'a> {
        Box::pin(async move {
            Ok(Generation::new(
                self.model.clone(),
                self.reply.clone(),
                self.usage,
            ))
        })
    }
}

pub struct FixedReplyProvider {
    pub reply: String,
    pub usage: Option<TokenUsage>,
}

impl ModelProvider for FixedReplyProvider {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        Ok(Arc::new(FixedReply {
            model: model_id.to_string(),
            reply: self.reply.clone(),
            usage: self.usage,
        }))
    }
}

/// A ledger in a fresh temporary directory. Keep the guard alive.
pub fn temp_ledger() -> (tempfile::TempDir, UsageLedger) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = UsageLedger::open(dir.path().join("usage.db")).expect("open ledger");
    (dir, ledger)
}

pub fn coordinator_with(provider: Arc<dyn ModelProvider>) -> (tempfile::TempDir, Coordinator) {
    let (dir, ledger) = temp_ledger();
    let coordinator = Coordinator::new(provider, ledger, LocalModelMatcher::default());
    (dir, coordinator)
}

pub fn fixed_reply(reply: &str, usage: Option<TokenUsage>) -> Arc<dyn ModelProvider> {
    Arc::new(FixedReplyProvider {
        reply: reply.to_string(),
        usage,
    })
}

/// Mount a non-streaming Chat Completions response.
pub async fn mount_chat_completion(
    server: &MockServer,
    content: &str,
    usage: Option<(u64, u64)>,
) {
    let mut body = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_234_567_890,
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    });
    if let Some((prompt_tokens, completion_tokens)) = usage {
        body["usage"] = serde_json::json!({
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        });
    }

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Mount an error status with a JSON error body.
pub async fn mount_chat_error(server: &MockServer, status: u16, message: &str) {
    let body = serde_json::json!({
        "error": { "message": message, "type": "invalid_request_error" }
    });
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}
