//! Run constraints and layered configuration.
//!
//! Configuration resolves in three layers: built-in defaults, then an
//! optional TOML file, then environment variables. Unknown keys in the file
//! are a load error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Resource limits enforced by the core. Every field is user-configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Constraints {
    /// Maximum recursion depth for goal decomposition
    pub max_depth: u32,
    /// Wall-clock ceiling for the whole run
    #[serde(with = "duration_secs")]
    pub max_time: Duration,
    /// Maximum number of goals started in the run
    pub max_goals: usize,
    /// Hard cost ceiling in USD (ε-tolerant on the breaching call)
    pub max_cost_usd: f64,
    /// Maximum concurrently in-flight goals
    pub max_concurrent: usize,
    /// Result limit for sources without a per-source entry
    pub default_result_limit: usize,
    /// Reformulation attempts per (goal, source) pair
    pub max_retries_per_goal: u32,
    /// Relevance score threshold (0-10) for accepting evidence
    pub filter_threshold: u8,
    /// Minimum accepted results before a goal is considered satisfiable
    /// without follow-ups
    pub min_results_to_continue: usize,
    /// Per-source result limits, keyed by canonical source id. Kept last:
    /// TOML tables must follow plain values.
    pub per_source_result_limit: HashMap<String, usize>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_time: Duration::from_secs(600),
            max_goals: 25,
            max_cost_usd: 2.0,
            max_concurrent: 4,
            default_result_limit: 10,
            max_retries_per_goal: 2,
            filter_threshold: 6,
            min_results_to_continue: 1,
            per_source_result_limit: HashMap::new(),
        }
    }
}

impl Constraints {
    /// The result limit for one source.
    pub fn result_limit_for(&self, source_id: &str) -> usize {
        self.per_source_result_limit
            .get(source_id)
            .copied()
            .unwrap_or(self.default_result_limit)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmSettings {
    /// Model id passed to the transport
    pub model: String,
    /// Per-call wall-clock timeout in seconds
    pub timeout_s: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20241022".to_string(),
            timeout_s: 180,
        }
    }
}

/// Per-source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SourceSettings {
    /// Feature flag; disabled sources are never instantiated
    pub enabled: bool,
    /// Override for the API-key environment variable
    pub api_key_env: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: None,
        }
    }
}

/// Evidence filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FilterSettings {
    /// Relevance threshold (0-10)
    pub threshold: u8,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self { threshold: 6 }
    }
}

/// Full layered configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub llm: LlmSettings,
    pub sources: HashMap<String, SourceSettings>,
    pub limits: Constraints,
    pub filter: FilterSettings,
}

impl Config {
    /// Load configuration: defaults, overlaid by `path` if given, overlaid
    /// by environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str::<Config>(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(model) = std::env::var("DOSSIER_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(raw) = std::env::var("DOSSIER_LLM_TIMEOUT_S") {
            self.llm.timeout_s = parse_env("DOSSIER_LLM_TIMEOUT_S", &raw)?;
        }
        if let Ok(raw) = std::env::var("DOSSIER_MAX_DEPTH") {
            self.limits.max_depth = parse_env("DOSSIER_MAX_DEPTH", &raw)?;
        }
        if let Ok(raw) = std::env::var("DOSSIER_MAX_COST_USD") {
            self.limits.max_cost_usd = parse_env("DOSSIER_MAX_COST_USD", &raw)?;
        }
        if let Ok(raw) = std::env::var("DOSSIER_MAX_CONCURRENT") {
            self.limits.max_concurrent = parse_env("DOSSIER_MAX_CONCURRENT", &raw)?;
        }
        if let Ok(raw) = std::env::var("DOSSIER_MAX_TIME_S") {
            let secs: u64 = parse_env("DOSSIER_MAX_TIME_S", &raw)?;
            self.limits.max_time = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("DOSSIER_FILTER_THRESHOLD") {
            self.filter.threshold = parse_env("DOSSIER_FILTER_THRESHOLD", &raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.filter.threshold > 10 {
            return Err(Error::Config(format!(
                "filter.threshold must be 0-10, got {}",
                self.filter.threshold
            )));
        }
        if self.limits.max_concurrent == 0 {
            return Err(Error::Config(
                "limits.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Constraints with the filter threshold folded in.
    pub fn constraints(&self) -> Constraints {
        let mut limits = self.limits.clone();
        limits.filter_threshold = self.filter.threshold;
        limits
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: '{raw}'")))
}
