//! Call execution: pool lookup, gate, model call, background usage write.

use std::sync::{Mutex, PoisonError};

use tokio::task::JoinSet;

use envoy_ledger::{UsageLedger, UsageRecord};
use envoy_providers::ProviderError;

use crate::gate::SerializationGate;
use crate::pool::ModelPool;
use crate::request::CallRequest;

/// Runs model calls and records their token usage.
///
/// Usage rows are written on the blocking pool after the call returns, so the
/// caller never waits on storage. Call [`drain_pending_writes`] before
/// shutdown to flush them. Dropping the executor detaches writes still in
/// flight; they run to completion on their own.
///
/// [`drain_pending_writes`]: CallExecutor::drain_pending_writes
pub struct CallExecutor {
    pool: ModelPool,
    gate: SerializationGate,
    ledger: UsageLedger,
    pending: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for CallExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallExecutor")
            .field("pool", &self.pool)
            .field("gate", &self.gate)
            .field("ledger", &self.ledger)
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

impl CallExecutor {
    pub fn new(pool: ModelPool, gate: SerializationGate, ledger: UsageLedger) -> Self {
        Self {
            pool,
            gate,
            ledger,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    #[must_use]
    pub fn gate(&self) -> &SerializationGate {
        &self.gate
    }

    #[must_use]
    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Run one call and return the model's text.
    ///
    /// A request carrying an override caller is answered by that caller alone.
    /// Errors from resolution or generation are returned unchanged.
    pub async fn execute(&self, mut request: CallRequest) -> Result<String, ProviderError> {
        if let Some(caller) = request.take_caller() {
            tracing::debug!(
                model = request.model_id(),
                log_id = request.log_id(),
                "Call answered by override"
            );
            return caller.call(&request).await;
        }

        let handle = self.pool.get(request.model_id())?;
        let generate = request.generate_request();

        let generation = {
            let permit = self.gate.guard(request.model_id()).await;
            let local = permit.is_exclusive();
            let result = handle.generate(request.prompt(), &generate).await;
            drop(permit);
            tracing::debug!(model = request.model_id(), local, "Model call returned");
            result?
        };

        match generation.usage() {
            Ok(usage) => {
                tracing::info!(
                    model = request.model_id(),
                    agent = request.agent_id(),
                    game = request.game_id(),
                    phase = request.phase_id(),
                    log_id = request.log_id(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Model call completed"
                );
                self.schedule_write(UsageRecord::new(
                    request.game_id(),
                    request.agent_id(),
                    request.phase_id(),
                    request.model_id(),
                    usage,
                ));
            }
            Err(e) => {
                tracing::warn!(
                    model = request.model_id(),
                    agent = request.agent_id(),
                    log_id = request.log_id(),
                    "{e}; usage not recorded"
                );
            }
        }

        Ok(generation.into_text())
    }

    fn schedule_write(&self, record: UsageRecord) {
        let ledger = self.ledger.clone();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = pending.try_join_next() {
            log_join_failure(finished);
        }
        pending.spawn_blocking(move || ledger.append(&record));
    }

    /// Usage writes scheduled but not yet reaped.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = pending.try_join_next() {
            log_join_failure(finished);
        }
        pending.len()
    }

    /// Wait for every scheduled usage write. Returns how many finished.
    pub async fn drain_pending_writes(&self) -> usize {
        let mut pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut completed = 0;
        while let Some(finished) = pending.join_next().await {
            if finished.is_ok() {
                completed += 1;
            }
            log_join_failure(finished);
        }
        if completed > 0 {
            tracing::debug!(completed, "Drained usage writes");
        }
        completed
    }
}

impl Drop for CallExecutor {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        let detached = pending.len();
        pending.detach_all();
        if detached > 0 {
            tracing::debug!(detached, "Detached usage writes on drop");
        }
    }
}

fn log_join_failure(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::warn!("Usage write task failed: {e}");
    }
}
