//! Memoizing cache of model handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use envoy_providers::{ModelHandle, ModelProvider, ProviderError};

/// Maps model identifiers to live handles, resolving each id at most once.
///
/// Handles are never evicted; they live as long as the pool.
pub struct ModelPool {
    provider: Arc<dyn ModelProvider>,
    handles: Mutex<HashMap<String, Arc<dyn ModelHandle>>>,
}

impl std::fmt::Debug for ModelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPool").field("cached", &self.len()).finish()
    }
}

impl ModelPool {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The cached handle for `model_id`, resolving it on first use.
    ///
    /// Resolution runs with the cache locked, so concurrent first lookups of
    /// one id produce a single handle. Failures are returned and not cached.
    pub fn get(&self, model_id: &str) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.get(model_id) {
            tracing::debug!(model = model_id, "Model pool hit");
            return Ok(Arc::clone(handle));
        }

        let handle = self.provider.resolve(model_id)?;
        tracing::debug!(model = model_id, "Model pool miss; handle resolved");
        handles.insert(model_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(model_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
