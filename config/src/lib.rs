//! Configuration loading for Envoy.
//!
//! Configuration lives at `$ENVOY_CONFIG` or `~/.envoy/config.toml`. A missing
//! file is not an error: every section has defaults.
//!
//! ```toml
//! [ledger]
//! path = "~/.envoy/usage.db"
//!
//! [gate]
//! local_prefixes = ["ollama/", "llamacpp/", "local/"]
//!
//! [defaults]
//! game_id = "unknown_game"
//! phase_id = "unknown_phase"
//! agent_id = "unknown_agent"
//!
//! [[backends]]
//! prefix = "ollama/"
//! base_url = "http://localhost:11434/v1"
//!
//! [[backends]]
//! prefix = ""
//! base_url = "https://api.openai.com/v1"
//! api_key = "${OPENAI_API_KEY}"
//! ```
//!
//! String values may reference environment variables as `${NAME}`.

use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::{Host, Url};

pub const CONFIG_ENV_VAR: &str = "ENVOY_CONFIG";

/// Model-id prefixes served by single-process local backends.
///
/// Only deployment-location prefixes: bare model-family names would also
/// match remotely hosted models and serialize them for no reason.
pub const DEFAULT_LOCAL_PREFIXES: &[&str] = &["ollama/", "llamacpp/", "local/"];

pub const DEFAULT_GAME_ID: &str = "unknown_game";
pub const DEFAULT_PHASE_ID: &str = "unknown_phase";
pub const DEFAULT_AGENT_ID: &str = "unknown_agent";

// Default value function for serde (bool::default() is false, so only true needs a fn)
const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvoyConfig {
    pub ledger: Option<LedgerConfig>,
    pub gate: Option<GateConfig>,
    pub defaults: Option<DefaultsConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerConfig {
    /// SQLite file for usage rows. `~/` and `${VAR}` are expanded.
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GateConfig {
    /// Replaces [`DEFAULT_LOCAL_PREFIXES`] when set. An empty list disables serialization.
    pub local_prefixes: Option<Vec<String>>,
}

/// Attribution fallbacks for calls that omit game, phase, or agent.
#[derive(Debug, Default, Deserialize)]
pub struct DefaultsConfig {
    pub game_id: Option<String>,
    pub phase_id: Option<String>,
    pub agent_id: Option<String>,
}

/// One inference backend speaking the Chat Completions API.
#[derive(Deserialize)]
pub struct BackendConfig {
    /// Model-id prefix routed to this backend. Empty means fallback.
    #[serde(default)]
    pub prefix: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Remove `prefix` from the model id before sending it upstream.
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
    pub timeout_secs: Option<u64>,
    /// Permit plain http to a non-loopback host.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("prefix", &self.prefix)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("strip_prefix", &self.strip_prefix)
            .field("timeout_secs", &self.timeout_secs)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .finish()
    }
}

/// A backend entry after env expansion and URL validation.
#[derive(Clone)]
pub struct BackendSpec {
    pub prefix: String,
    pub base_url: Url,
    pub api_key: Option<String>,
    pub strip_prefix: bool,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for BackendSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSpec")
            .field("prefix", &self.prefix)
            .field("base_url", &self.base_url.as_str())
            .field(
                "api_key",
                &if self.api_key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("strip_prefix", &self.strip_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Resolved attribution fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDefaults {
    pub game_id: String,
    pub phase_id: String,
    pub agent_id: String,
}

impl Default for CallDefaults {
    fn default() -> Self {
        Self {
            game_id: DEFAULT_GAME_ID.to_string(),
            phase_id: DEFAULT_PHASE_ID.to_string(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
        }
    }
}

/// Replace `${NAME}` with the value of `NAME` (empty when unset).
///
/// An unterminated `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        if !name.is_empty() {
            out.push_str(&env::var(name).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(value)
}

/// `~/.envoy`, or `./.envoy` when no home directory is known.
#[must_use]
pub fn envoy_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".envoy"), |home| home.join(".envoy"))
}

/// `$ENVOY_CONFIG` if set, otherwise `~/.envoy/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV_VAR)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".envoy").join("config.toml"))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

impl BackendConfig {
    pub fn to_spec(&self) -> Result<BackendSpec, ConfigError> {
        let raw_url = expand_env_vars(&self.base_url);
        let base_url = Url::parse(raw_url.trim()).map_err(|e| {
            ConfigError::invalid(format!("backend '{}': bad base_url '{raw_url}': {e}", self.prefix))
        })?;

        match base_url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http || is_loopback(&base_url) => {}
            "http" => {
                return Err(ConfigError::invalid(format!(
                    "backend '{}': plain http is only allowed for loopback hosts (got {base_url}); \
                     set allow_insecure_http = true to override",
                    self.prefix
                )));
            }
            other => {
                return Err(ConfigError::invalid(format!(
                    "backend '{}': unsupported scheme '{other}'",
                    self.prefix
                )));
            }
        }

        let api_key = self
            .api_key
            .as_deref()
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty());

        Ok(BackendSpec {
            prefix: self.prefix.clone(),
            base_url,
            api_key,
            strip_prefix: self.strip_prefix,
            timeout: self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        })
    }
}

impl EnvoyConfig {
    /// Load from [`config_path`]. `Ok(None)` when there is no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), backends = config.backends.len(), "Config loaded");
        Ok(config)
    }

    /// Check every backend entry without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_specs().map(|_| ())
    }

    pub fn backend_specs(&self) -> Result<Vec<BackendSpec>, ConfigError> {
        let fallbacks = self.backends.iter().filter(|b| b.prefix.is_empty()).count();
        if fallbacks > 1 {
            return Err(ConfigError::invalid(
                "at most one backend may have an empty prefix",
            ));
        }
        self.backends.iter().map(BackendConfig::to_spec).collect()
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .as_ref()
            .and_then(|ledger| ledger.path.as_deref())
            .map(expand_env_vars)
            .filter(|path| !path.trim().is_empty())
            .map_or_else(|| envoy_dir().join("usage.db"), |path| expand_home(&path))
    }

    #[must_use]
    pub fn local_prefixes(&self) -> Vec<String> {
        match self.gate.as_ref().and_then(|gate| gate.local_prefixes.as_ref()) {
            Some(prefixes) => prefixes.clone(),
            None => DEFAULT_LOCAL_PREFIXES.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn call_defaults(&self) -> CallDefaults {
        let mut defaults = CallDefaults::default();
        if let Some(section) = &self.defaults {
            let pick = |value: &Option<String>, slot: &mut String| {
                if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                    *slot = value.to_string();
                }
            };
            pick(&section.game_id, &mut defaults.game_id);
            pick(&section.phase_id, &mut defaults.phase_id);
            pick(&section.agent_id, &mut defaults.agent_id);
        }
        defaults
    }
}
