//! Chat Completions backend.
//!
//! Speaks the non-streaming `POST {base_url}/chat/completions` dialect shared by
//! OpenAI and most self-hosted inference servers. One [`OpenAiCompatProvider`]
//! owns one HTTP client; every handle it resolves shares that client.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::{
    GenerateFut, GenerateRequest, Generation, ModelHandle, ModelProvider, ProviderError,
    TokenUsage, ToolDefinition, build_http_client, read_capped_error_body,
};

/// Bearer credential for a backend.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: Url,
    pub api_key: Option<ApiKey>,
    /// Total request timeout. `None` leaves only the connect timeout.
    pub timeout: Option<Duration>,
}

impl OpenAiCompatConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            api_key: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: ApiKey) -> Self {
        self.api_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}

#[derive(Debug)]
struct Backend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<ApiKey>,
}

/// Provider for Chat Completions compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    backend: Arc<Backend>,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, reqwest::Error> {
        let https_only = config.base_url.scheme() == "https";
        let client = build_http_client(https_only, config.timeout)?;
        Ok(Self {
            backend: Arc::new(Backend {
                client,
                endpoint: config.endpoint(),
                api_key: config.api_key,
            }),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.backend.endpoint
    }
}

impl ModelProvider for OpenAiCompatProvider {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        if model_id.trim().is_empty() {
            return Err(ProviderError::unknown_model(model_id));
        }
        Ok(Arc::new(OpenAiCompatModel {
            backend: Arc::clone(&self.backend),
            model: model_id.to_string(),
        }))
    }
}

/// A model served by a Chat Completions backend.
#[derive(Debug)]
pub struct OpenAiCompatModel {
    backend: Arc<Backend>,
    model: String,
}

impl OpenAiCompatModel {
    async fn send(&self, prompt: &str, request: &GenerateRequest) -> Result<Generation, ProviderError> {
        let body = build_request_body(&self.model, prompt, request);

        let mut builder = self
            .backend
            .client
            .post(&self.backend.endpoint)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.backend.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(|source| ProviderError::Request {
            model: self.model.clone(),
            source,
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            return Err(ProviderError::Http {
                model: self.model.clone(),
                status,
                body,
            });
        }

        let payload: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
            model: self.model.clone(),
            message: e.to_string(),
        })?;

        parse_response(&self.model, payload)
    }
}

impl ModelHandle for OpenAiCompatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn generate<'a>(&'a self, prompt: &'a str, request: &'a GenerateRequest) -> GenerateFut<'a> {
        Box::pin(self.send(prompt, request))
    }
}

fn build_request_body(model: &str, prompt: &str, request: &GenerateRequest) -> Value {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system_prompt.as_deref()
        && !system.trim().is_empty()
    {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": prompt }));

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), json!(false));

    if let Some(temperature) = request.options.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = request.options.max_output_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }

    if !request.tools.is_empty() {
        body.insert("tools".to_string(), tool_definitions(&request.tools));
    }

    Value::Object(body)
}

fn tool_definitions(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

fn parse_response(model: &str, payload: Value) -> Result<Generation, ProviderError> {
    let completion: ChatCompletion =
        serde_json::from_value(payload).map_err(|e| ProviderError::MalformedResponse {
            model: model.to_string(),
            message: e.to_string(),
        })?;

    let message = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .ok_or_else(|| ProviderError::MalformedResponse {
            model: model.to_string(),
            message: "response contained no choices".to_string(),
        })?;

    // Tool-only replies have no content; surface the calls as JSON so
    // structured callers can still consume them.
    let text = match (message.content, message.tool_calls) {
        (Some(content), _) => content,
        (None, Some(calls)) if !calls.is_empty() => json!({ "tool_calls": calls }).to_string(),
        (None, _) => String::new(),
    };

    let usage = completion.usage.and_then(|usage| {
        match (usage.prompt_tokens, usage.completion_tokens) {
            (Some(input), Some(output)) => Some(TokenUsage::new(input, output)),
            _ => None,
        }
    });

    Ok(Generation::new(model, text, usage))
}
