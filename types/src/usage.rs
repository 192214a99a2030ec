//! Token accounting types shared by providers, the ledger, and the coordinator.

use serde::{Deserialize, Serialize};

/// Token consumption reported by a backend for a single completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// One row of the usage ledger, as handed to the store.
///
/// The timestamp is not part of the record: the store assigns it at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub game_id: String,
    pub agent_id: String,
    pub phase_id: String,
    pub model_id: String,
    pub usage: TokenUsage,
}

impl UsageRecord {
    pub fn new(
        game_id: impl Into<String>,
        agent_id: impl Into<String>,
        phase_id: impl Into<String>,
        model_id: impl Into<String>,
        usage: TokenUsage,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            agent_id: agent_id.into(),
            phase_id: phase_id.into(),
            model_id: model_id.into(),
            usage,
        }
    }
}
