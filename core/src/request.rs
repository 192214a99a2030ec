//! Call parameters and the override hook.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use envoy_config::CallDefaults;
use envoy_providers::{GenerateOptions, GenerateRequest, ModelHandle, ProviderError, ToolDefinition};

/// Override hook future type alias.
pub type CallFut<'a> = Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>>;

/// Replaces the model call for a request.
///
/// When a request carries a caller, the executor hands the whole request to
/// it and returns its answer: no pool lookup, no gate, no usage row.
pub trait LlmCaller: Send + Sync {
    fn call<'a>(&'a self, request: &'a CallRequest) -> CallFut<'a>;

    /// A handle that supersedes the pool for `model_id`.
    fn model(&self, _model_id: &str) -> Option<Arc<dyn ModelHandle>> {
        None
    }
}

struct FnCaller<F>(F);

impl<F, Fut> LlmCaller for FnCaller<F>
where
    F: Fn(&CallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ProviderError>> + Send + 'static,
{
    fn call<'a>(&'a self, request: &'a CallRequest) -> CallFut<'a> {
        Box::pin((self.0)(request))
    }
}

/// Wrap a closure as an [`LlmCaller`].
///
/// The returned future must own its data, so copy what you need out of the
/// request before the `async move` block.
pub fn caller_fn<F, Fut>(f: F) -> Arc<dyn LlmCaller>
where
    F: Fn(&CallRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ProviderError>> + Send + 'static,
{
    Arc::new(FnCaller(f))
}

/// Everything one model call needs.
///
/// Built by value; the executor consumes it.
#[derive(Clone)]
pub struct CallRequest {
    prompt: String,
    model_id: String,
    agent_id: String,
    game_id: String,
    phase_id: String,
    system_prompt: Option<String>,
    tools: Vec<ToolDefinition>,
    expected_fields: Option<Vec<String>>,
    log_id: String,
    options: GenerateOptions,
    caller: Option<Arc<dyn LlmCaller>>,
}

impl std::fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRequest")
            .field("model_id", &self.model_id)
            .field("agent_id", &self.agent_id)
            .field("game_id", &self.game_id)
            .field("phase_id", &self.phase_id)
            .field("log_id", &self.log_id)
            .field("prompt_len", &self.prompt.len())
            .field("has_system_prompt", &self.system_prompt.is_some())
            .field("tools", &self.tools.len())
            .field("expected_fields", &self.expected_fields)
            .field("options", &self.options)
            .field("has_caller", &self.caller.is_some())
            .finish()
    }
}

impl CallRequest {
    /// A request attributed to the built-in fallback game, phase, and agent.
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self::with_defaults(prompt, model_id, &CallDefaults::default())
    }

    pub fn with_defaults(
        prompt: impl Into<String>,
        model_id: impl Into<String>,
        defaults: &CallDefaults,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: model_id.into(),
            agent_id: defaults.agent_id.clone(),
            game_id: defaults.game_id.clone(),
            phase_id: defaults.phase_id.clone(),
            system_prompt: None,
            tools: Vec::new(),
            expected_fields: None,
            log_id: uuid::Uuid::new_v4().to_string(),
            options: GenerateOptions::default(),
            caller: None,
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    #[must_use]
    pub fn with_game(mut self, game_id: impl Into<String>) -> Self {
        self.game_id = game_id.into();
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = phase_id.into();
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_expected_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: Arc<dyn LlmCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn phase_id(&self) -> &str {
        &self.phase_id
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn expected_fields(&self) -> Option<&[String]> {
        self.expected_fields.as_deref()
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    pub(crate) fn take_caller(&mut self) -> Option<Arc<dyn LlmCaller>> {
        self.caller.take()
    }

    pub(crate) fn generate_request(&self) -> GenerateRequest {
        GenerateRequest {
            system_prompt: self.system_prompt.clone(),
            tools: self.tools.clone(),
            options: self.options,
        }
    }
}

/// Optional parameters for the facade's text and JSON calls.
///
/// Anything left unset falls back to the coordinator's [`CallDefaults`].
#[derive(Clone, Default)]
pub struct CallOptions {
    pub game_id: Option<String>,
    pub phase_id: Option<String>,
    pub system_prompt: Option<String>,
    pub expected_fields: Option<Vec<String>>,
    pub tools: Vec<ToolDefinition>,
    pub generate: GenerateOptions,
    pub log_id: Option<String>,
    pub caller: Option<Arc<dyn LlmCaller>>,
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("game_id", &self.game_id)
            .field("phase_id", &self.phase_id)
            .field("has_system_prompt", &self.system_prompt.is_some())
            .field("expected_fields", &self.expected_fields)
            .field("tools", &self.tools.len())
            .field("generate", &self.generate)
            .field("log_id", &self.log_id)
            .field("has_caller", &self.caller.is_some())
            .finish()
    }
}

impl CallOptions {
    #[must_use]
    pub fn with_game(mut self, game_id: impl Into<String>) -> Self {
        self.game_id = Some(game_id.into());
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    #[must_use]
    pub fn with_expected_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_generate(mut self, options: GenerateOptions) -> Self {
        self.generate = options;
        self
    }

    #[must_use]
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: Arc<dyn LlmCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub(crate) fn into_request(
        self,
        prompt: impl Into<String>,
        model_id: impl Into<String>,
        agent_id: Option<&str>,
        defaults: &CallDefaults,
    ) -> CallRequest {
        let mut request = CallRequest::with_defaults(prompt, model_id, defaults)
            .with_tools(self.tools)
            .with_options(self.generate);
        if let Some(agent_id) = agent_id.filter(|a| !a.trim().is_empty()) {
            request = request.with_agent(agent_id);
        }
        if let Some(game_id) = self.game_id.filter(|g| !g.trim().is_empty()) {
            request = request.with_game(game_id);
        }
        if let Some(phase_id) = self.phase_id.filter(|p| !p.trim().is_empty()) {
            request = request.with_phase(phase_id);
        }
        request.system_prompt = self.system_prompt;
        request.expected_fields = self.expected_fields;
        if let Some(log_id) = self.log_id {
            request = request.with_log_id(log_id);
        }
        request.caller = self.caller;
        request
    }
}
