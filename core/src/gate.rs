//! Serialization gate for local model backends.
//!
//! Local backends run one inference at a time; overlapping requests thrash or
//! fail. Every call to a local model id waits on one shared lock, while remote
//! ids pass straight through.

use tokio::sync::{Mutex, MutexGuard};

use envoy_config::DEFAULT_LOCAL_PREFIXES;

/// Decides which model ids are served locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModelMatcher {
    /// Lower-cased, non-blank.
    prefixes: Vec<String>,
}

impl Default for LocalModelMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_PREFIXES)
    }
}

impl LocalModelMatcher {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = prefixes
            .into_iter()
            .map(|p| p.as_ref().trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { prefixes }
    }

    /// A matcher that treats every id as remote.
    #[must_use]
    pub fn none() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_local(&self, model_id: &str) -> bool {
        let lowered = model_id.to_ascii_lowercase();
        self.prefixes.iter().any(|p| lowered.starts_with(p.as_str()))
    }

    #[must_use]
    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

/// Proof of passage through the gate. Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct GatePermit<'a> {
    guard: Option<MutexGuard<'a, ()>>,
}

impl GatePermit<'_> {
    /// Whether this permit holds the local-model lock.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.guard.is_some()
    }
}

/// One process-wide lock shared by all local model ids.
#[derive(Debug, Default)]
pub struct SerializationGate {
    matcher: LocalModelMatcher,
    lock: Mutex<()>,
}

impl SerializationGate {
    pub fn new(matcher: LocalModelMatcher) -> Self {
        Self {
            matcher,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn matcher(&self) -> &LocalModelMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn is_local(&self, model_id: &str) -> bool {
        self.matcher.is_local(model_id)
    }

    /// Wait for the local-model lock if `model_id` is local; otherwise return at once.
    ///
    /// Cancelling the returned future while it waits leaves the lock untouched.
    pub async fn guard(&self, model_id: &str) -> GatePermit<'_> {
        if !self.matcher.is_local(model_id) {
            return GatePermit { guard: None };
        }
        tracing::debug!(model = model_id, "Waiting for local model gate");
        let guard = self.lock.lock().await;
        tracing::debug!(model = model_id, "Local model gate acquired");
        GatePermit { guard: Some(guard) }
    }
}
