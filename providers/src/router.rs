//! Prefix-based dispatch across several providers.

use std::sync::Arc;

use crate::{ModelHandle, ModelProvider, ProviderError};

struct Route {
    /// Lower-cased (ASCII) prefix.
    prefix: String,
    provider: Arc<dyn ModelProvider>,
    strip_prefix: bool,
}

/// Routes model identifiers to providers by case-insensitive prefix.
///
/// Routes are tried in insertion order and the first match wins. Identifiers
/// matching no route go to the fallback provider, if one is set.
#[derive(Default)]
pub struct ProviderRouter {
    routes: Vec<Route>,
    fallback: Option<Arc<dyn ModelProvider>>,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefixes: Vec<&str> = self.routes.iter().map(|r| r.prefix.as_str()).collect();
        f.debug_struct("ProviderRouter")
            .field("prefixes", &prefixes)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ProviderRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. With `strip_prefix`, `ollama/llama3` reaches the provider as `llama3`.
    ///
    /// An empty prefix is treated as the fallback.
    #[must_use]
    pub fn route(
        mut self,
        prefix: &str,
        provider: Arc<dyn ModelProvider>,
        strip_prefix: bool,
    ) -> Self {
        if prefix.is_empty() {
            self.fallback = Some(provider);
            return self;
        }
        self.routes.push(Route {
            prefix: prefix.to_ascii_lowercase(),
            provider,
            strip_prefix,
        });
        self
    }

    #[must_use]
    pub fn fallback(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl ModelProvider for ProviderRouter {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        let lowered = model_id.to_ascii_lowercase();
        if let Some(route) = self.routes.iter().find(|r| lowered.starts_with(&r.prefix)) {
            let upstream = if route.strip_prefix {
                // ASCII lowercasing preserves byte offsets.
                &model_id[route.prefix.len()..]
            } else {
                model_id
            };
            if upstream.trim().is_empty() {
                return Err(ProviderError::unknown_model(model_id));
            }
            tracing::debug!(model = model_id, upstream, prefix = %route.prefix, "Routing model");
            return route.provider.resolve(upstream);
        }

        match &self.fallback {
            Some(provider) => provider.resolve(model_id),
            None => Err(ProviderError::unknown_model(model_id)),
        }
    }
}
