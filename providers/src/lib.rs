//! Model provider abstraction with pluggable backends.
//!
//! # Architecture
//!
//! The crate is organized around two object-safe traits:
//!
//! - [`ModelProvider`] - resolves a model identifier into a live handle
//! - [`ModelHandle`] - a loaded model that can [`generate`](ModelHandle::generate) text
//!
//! Concrete backends:
//!
//! - [`openai_compat`] - any server speaking the Chat Completions API (OpenAI,
//!   Ollama, llama.cpp server, vLLM)
//! - [`router`] - dispatches model identifiers to backends by prefix
//!
//! # Error Handling
//!
//! Every failure during resolution or generation is a [`ProviderError`]. Callers
//! receive it unmodified; there is no retry layer in this crate.
//!
//! Token usage is optional on a [`Generation`]: backends that do not report it
//! yield [`UsageUnavailable`] from [`Generation::usage`].

pub mod openai_compat;
pub mod router;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use envoy_types::{GenerateOptions, TokenUsage, ToolDefinition};
pub use openai_compat::{ApiKey, OpenAiCompatConfig, OpenAiCompatProvider};
pub use router::ProviderRouter;

pub use envoy_types;

const CONNECT_TIMEOUT_SECS: u64 = 30;

// TCP keepalive (idle time); interval/retries use platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Generation future type alias.
pub type GenerateFut<'a> =
    Pin<Box<dyn Future<Output = Result<Generation, ProviderError>> + Send + 'a>>;

/// Error types for model resolution and generation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown model: {model}")]
    UnknownModel { model: String },
    #[error("Request to {model} failed: {source}")]
    Request {
        model: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("API error {status} from {model}: {body}")]
    Http {
        model: String,
        status: u16,
        body: String,
    },
    #[error("Malformed response from {model}: {message}")]
    MalformedResponse { model: String, message: String },
    #[error("Backend failure for {model}: {message}")]
    Backend { model: String, message: String },
}

impl ProviderError {
    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel {
            model: model.into(),
        }
    }

    /// Failure raised by a backend that is not HTTP-based (custom providers, test doubles).
    pub fn backend(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            model: model.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            ProviderError::UnknownModel { model }
            | ProviderError::Request { model, .. }
            | ProviderError::Http { model, .. }
            | ProviderError::MalformedResponse { model, .. }
            | ProviderError::Backend { model, .. } => model,
        }
    }
}

/// A response carried no usable token counts.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Model {model} did not report token usage")]
pub struct UsageUnavailable {
    pub model: String,
}

/// Everything besides the prompt that a single generation needs.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub options: GenerateOptions,
}

/// A completed (non-streaming) generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    model: String,
    text: String,
    usage: Option<TokenUsage>,
}

impl Generation {
    pub fn new(model: impl Into<String>, text: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            model: model.into(),
            text: text.into(),
            usage,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn into_text(self) -> String {
        self.text
    }

    pub fn usage(&self) -> Result<TokenUsage, UsageUnavailable> {
        self.usage.ok_or_else(|| UsageUnavailable {
            model: self.model.clone(),
        })
    }
}

/// A loaded generative model.
///
/// Handles are shared: one instance serves every caller asking for the same
/// model identifier, so implementations must tolerate concurrent `generate`
/// calls (serialization, where needed, happens above this layer).
pub trait ModelHandle: Send + Sync {
    fn model_id(&self) -> &str;
    fn generate<'a>(&'a self, prompt: &'a str, request: &'a GenerateRequest) -> GenerateFut<'a>;
}

/// Resolves model identifiers into handles.
pub trait ModelProvider: Send + Sync {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError>;
}

fn base_client_builder(https_only: bool) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(https_only)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

pub(crate) fn build_http_client(
    https_only: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = base_client_builder(https_only);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

pub async fn read_capped_error_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
