//! The public call surface.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};

use envoy_config::{CallDefaults, EnvoyConfig};
use envoy_ledger::UsageLedger;
use envoy_providers::{
    ApiKey, ModelHandle, ModelProvider, OpenAiCompatConfig, OpenAiCompatProvider, ProviderRouter,
};

use crate::errors::CoordinatorError;
use crate::executor::CallExecutor;
use crate::gate::{LocalModelMatcher, SerializationGate};
use crate::parser::{self, CallResult};
use crate::pool::ModelPool;
use crate::request::{CallOptions, CallRequest, LlmCaller};

/// Single entry point for every model call in the process.
///
/// Build one at startup, wrap it in an `Arc`, and share it. It owns the model
/// pool and the local-model gate, so two coordinators do not serialize against
/// each other.
#[derive(Debug)]
pub struct Coordinator {
    executor: CallExecutor,
    defaults: CallDefaults,
}

impl Coordinator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        ledger: UsageLedger,
        matcher: LocalModelMatcher,
    ) -> Self {
        Self {
            executor: CallExecutor::new(
                ModelPool::new(provider),
                SerializationGate::new(matcher),
                ledger,
            ),
            defaults: CallDefaults::default(),
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: CallDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Wire backends, ledger, gate, and defaults from configuration.
    pub fn from_config(config: &EnvoyConfig) -> anyhow::Result<Self> {
        let specs = config.backend_specs()?;
        if specs.is_empty() {
            tracing::warn!("No backends configured; every model id will be unknown");
        }

        let mut router = ProviderRouter::new();
        for spec in specs {
            let mut backend = OpenAiCompatConfig::new(spec.base_url.clone());
            if let Some(key) = spec.api_key {
                backend = backend.with_api_key(ApiKey::new(key));
            }
            if let Some(timeout) = spec.timeout {
                backend = backend.with_timeout(timeout);
            }
            let provider = OpenAiCompatProvider::new(backend).with_context(|| {
                format!("Failed to build HTTP client for backend '{}'", spec.prefix)
            })?;
            tracing::debug!(prefix = %spec.prefix, endpoint = provider.endpoint(), "Backend configured");
            router = router.route(&spec.prefix, Arc::new(provider), spec.strip_prefix);
        }

        let ledger_path = config.ledger_path();
        let ledger = UsageLedger::open(&ledger_path)
            .with_context(|| format!("Failed to open usage ledger at {}", ledger_path.display()))?;

        let matcher = LocalModelMatcher::new(config.local_prefixes());
        Ok(Self::new(Arc::new(router), ledger, matcher).with_defaults(config.call_defaults()))
    }

    #[must_use]
    pub fn defaults(&self) -> &CallDefaults {
        &self.defaults
    }

    #[must_use]
    pub fn ledger(&self) -> &UsageLedger {
        self.executor.ledger()
    }

    #[must_use]
    pub fn pool(&self) -> &ModelPool {
        self.executor.pool()
    }

    #[must_use]
    pub fn is_local(&self, model_id: &str) -> bool {
        self.executor.gate().is_local(model_id)
    }

    /// A request pre-filled with this coordinator's attribution defaults.
    pub fn new_request(&self, prompt: impl Into<String>, model_id: impl Into<String>) -> CallRequest {
        CallRequest::with_defaults(prompt, model_id, &self.defaults)
    }

    /// Send `prompt` and return the raw text.
    pub async fn call_text(
        &self,
        prompt: &str,
        model_id: &str,
        agent_id: &str,
        options: CallOptions,
    ) -> Result<String, CoordinatorError> {
        let request = options.into_request(prompt, model_id, Some(agent_id), &self.defaults);
        self.request(request).await
    }

    /// Send `prompt` and return the JSON object found in the reply.
    ///
    /// Fails with [`CoordinatorError::InvalidResponse`] when the reply is
    /// empty, holds no object, or lacks one of `options.expected_fields`.
    pub async fn call_json(
        &self,
        prompt: &str,
        model_id: &str,
        agent_id: &str,
        options: CallOptions,
    ) -> Result<Map<String, Value>, CoordinatorError> {
        let request = options.into_request(prompt, model_id, Some(agent_id), &self.defaults);
        let expected = request.expected_fields().map(<[String]>::to_vec);
        let log_id = request.log_id().to_string();

        let raw = self.request(request).await?;
        let result = parser::parse_and_validate(&raw, expected.as_deref());

        result.into_result().map_err(|(outcome, message, raw_response)| {
            tracing::warn!(
                model = model_id,
                agent = agent_id,
                log_id = %log_id,
                %outcome,
                "Structured call failed: {message}"
            );
            CoordinatorError::InvalidResponse {
                model: model_id.to_string(),
                outcome,
                message: message.into_inner(),
                raw_response,
            }
        })
    }

    /// Run a fully specified request. No JSON handling.
    pub async fn request(&self, request: CallRequest) -> Result<String, CoordinatorError> {
        Ok(self.executor.execute(request).await?)
    }

    /// The pooled handle for `model_id`, unless `caller` supplies its own.
    pub fn get_model(
        &self,
        model_id: &str,
        caller: Option<&dyn LlmCaller>,
    ) -> Result<Arc<dyn ModelHandle>, CoordinatorError> {
        if let Some(handle) = caller.and_then(|c| c.model(model_id)) {
            return Ok(handle);
        }
        Ok(self.executor.pool().get(model_id)?)
    }

    #[must_use]
    pub fn parse_and_validate(&self, raw_text: &str, expected_fields: Option<&[String]>) -> CallResult {
        parser::parse_and_validate(raw_text, expected_fields)
    }

    /// Wait for background usage writes. Call before shutdown.
    pub async fn drain_pending_writes(&self) -> usize {
        self.executor.drain_pending_writes().await
    }
}
