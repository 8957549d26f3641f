//! Source registry: lazy construction, feature flags, name normalization.
//!
//! The registry stores constructors, not instances; adapters are built on
//! first use so that disabled or misconfigured sources cost nothing. A bad
//! adapter never prevents the others from loading: registration failures
//! are recorded and surfaced as `source_registration_failed` events at run
//! start.

use super::{SourceAdapter, SourceMetadata};
use crate::config::SourceSettings;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Constructor for a lazily-instantiated adapter.
pub type SourceCtor = Box<dyn Fn() -> Result<Arc<dyn SourceAdapter>> + Send + Sync>;

/// Normalize a source name to its canonical form.
///
/// Collapses spelling variants: `"SAM.gov"`, `"sam_gov"`, and
/// `"search_sam"` all normalize to `"sam"`. Idempotent:
/// `normalize_source_name(normalize_source_name(n)) == normalize_source_name(n)`.
pub fn normalize_source_name(name: &str) -> String {
    let mut s = name.trim().to_ascii_lowercase();
    for prefix in ["search_", "search-", "query_", "query-"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    for suffix in [".gov", "_gov", "-gov"] {
        if let Some(rest) = s.strip_suffix(suffix) {
            s = rest.to_string();
            break;
        }
    }
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

struct RegistryEntry {
    metadata: SourceMetadata,
    enabled: bool,
    ctor: SourceCtor,
}

/// Registry of source adapters keyed by canonical id.
pub struct SourceRegistry {
    entries: HashMap<String, RegistryEntry>,
    aliases: HashMap<String, String>,
    instances: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    registration_failures: Vec<(String, String)>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            aliases: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
            registration_failures: Vec::new(),
        }
    }

    /// Register a source. Validates the metadata structurally:
    /// - `id` must be canonical (`normalize_source_name(id) == id`) and unique
    /// - `display_name` must be non-empty
    /// - when `requires_api_key`, `api_key_env_var` must name a set,
    ///   non-empty environment variable
    pub fn register(&mut self, metadata: SourceMetadata, ctor: SourceCtor) -> Result<()> {
        let id = metadata.id.clone();
        if id.is_empty() {
            return Err(Error::registration(id, "empty source id"));
        }
        if normalize_source_name(&id) != id {
            return Err(Error::registration(
                &id,
                format!(
                    "id is not canonical; expected '{}'",
                    normalize_source_name(&id)
                ),
            ));
        }
        if metadata.display_name.is_empty() {
            return Err(Error::registration(&id, "empty display_name"));
        }
        if metadata.requires_api_key {
            let env_var = metadata.api_key_env_var.as_deref().ok_or_else(|| {
                Error::registration(&id, "requires_api_key set but api_key_env_var missing")
            })?;
            match std::env::var(env_var) {
                Ok(v) if !v.trim().is_empty() => {}
                _ => {
                    return Err(Error::registration(
                        &id,
                        format!("API key environment variable {env_var} is not set"),
                    ));
                }
            }
        }
        if self.entries.contains_key(&id) {
            return Err(Error::registration(&id, "duplicate source id"));
        }
        self.entries.insert(
            id,
            RegistryEntry {
                metadata,
                enabled: true,
                ctor,
            },
        );
        Ok(())
    }

    /// Register a source, recording failures instead of propagating them,
    /// so one bad adapter does not block the rest.
    pub fn register_or_record(&mut self, metadata: SourceMetadata, ctor: SourceCtor) {
        let id = metadata.id.clone();
        if let Err(err) = self.register(metadata, ctor) {
            tracing::warn!(source = %id, error = %err, "source registration failed");
            self.registration_failures.push((id, err.to_string()));
        }
    }

    /// Add an alias for an already-registered source. The alias is stored
    /// normalized.
    pub fn add_alias(&mut self, alias: &str, id: &str) -> Result<()> {
        if !self.entries.contains_key(id) {
            return Err(Error::registration(id, "alias target not registered"));
        }
        self.aliases
            .insert(normalize_source_name(alias), id.to_string());
        Ok(())
    }

    /// Resolve a possibly-variant name to a canonical registered id.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let normalized = normalize_source_name(name);
        if self.entries.contains_key(&normalized) {
            return Some(normalized);
        }
        self.aliases.get(&normalized).cloned()
    }

    /// Apply per-source feature flags from configuration.
    pub fn apply_settings(&mut self, settings: &HashMap<String, SourceSettings>) {
        for (name, source_settings) in settings {
            let Some(id) = self.resolve(name) else {
                tracing::warn!(source = %name, "config names an unregistered source");
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.enabled = source_settings.enabled;
            }
        }
    }

    /// Whether a source is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.resolve(name)
            .and_then(|id| self.entries.get(&id))
            .map(|e| e.enabled)
            .unwrap_or(false)
    }

    /// Fetch an adapter, instantiating it on first use. Returns `None` for
    /// unknown or disabled sources.
    pub fn get(&self, name: &str) -> Result<Option<Arc<dyn SourceAdapter>>> {
        let Some(id) = self.resolve(name) else {
            return Ok(None);
        };
        let entry = match self.entries.get(&id) {
            Some(entry) if entry.enabled => entry,
            _ => return Ok(None),
        };

        if let Some(existing) = self
            .instances
            .read()
            .expect("instances lock poisoned")
            .get(&id)
        {
            return Ok(Some(existing.clone()));
        }

        let adapter = (entry.ctor)()?;
        if adapter.metadata().id != id {
            return Err(Error::registration(
                &id,
                format!(
                    "constructed adapter reports id '{}'",
                    adapter.metadata().id
                ),
            ));
        }
        self.instances
            .write()
            .expect("instances lock poisoned")
            .insert(id, adapter.clone());
        Ok(Some(adapter))
    }

    /// Metadata for all enabled sources, ordered by id so prompts are
    /// deterministic.
    pub fn enabled_metadata(&self) -> Vec<&SourceMetadata> {
        let mut metas: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| &e.metadata)
            .collect();
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        metas
    }

    /// Registration failures recorded so far, as `(source_id, message)`.
    pub fn registration_failures(&self) -> &[(String, String)] {
        &self.registration_failures
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.entries.keys().collect::<Vec<_>>())
            .field("failures", &self.registration_failures.len())
            .finish()
    }
}
