//! Immutable model registry snapshots with atomic hot-reload.
//!
//! A [`RegistrySnapshot`] maps public model keys to resolved provider
//! configurations. [`ConfigRegistry`] publishes snapshots through an
//! [`ArcSwap`], so a reload is a single pointer swap: readers never block and
//! a request that loaded a snapshot keeps seeing exactly that snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use super::kind::ProviderKind;
use crate::config::{ApiKey, ConfigError, ConfigSource, ProviderConfig};

/// Where and how to reach a provider, computed once per snapshot.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// Full chat-completions URL.
    pub url: String,
    /// Model name as sent upstream.
    pub model: String,
    pub api_key: Option<ApiKey>,
}

/// A provider configuration together with everything derived from it.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub config: ProviderConfig,
    pub model_key: String,
    pub service_id: String,
    pub upstream: UpstreamTarget,
}

impl ResolvedProvider {
    fn resolve(config: ProviderConfig) -> Self {
        let profile = config.kind.profile();
        let url = format!(
            "{}{}",
            config.effective_base_url().trim_end_matches('/'),
            profile.chat_path
        );
        let upstream = UpstreamTarget {
            url,
            model: (profile.map_model)(&config.model_name),
            api_key: config.api_key.clone(),
        };

        Self {
            model_key: model_key(&config),
            service_id: config.service_id(),
            upstream,
            config,
        }
    }

    /// Name reported back to clients in the `model` field.
    pub fn public_name(&self) -> &str {
        &self.model_key
    }

    pub fn kind(&self) -> ProviderKind {
        self.config.kind
    }
}

/// Key under which a configuration is addressable by clients.
///
/// `public_name` if set, else `model_name`, else `<kind>_<first 8 chars of id>`.
pub fn model_key(config: &ProviderConfig) -> String {
    if !config.public_name.is_empty() {
        config.public_name.clone()
    } else if !config.model_name.is_empty() {
        config.model_name.clone()
    } else {
        let id_prefix: String = config.id.chars().take(8).collect();
        format!("{}_{}", config.kind.as_str(), id_prefix)
    }
}

/// One immutable view of the routable models.
#[derive(Debug)]
pub struct RegistrySnapshot {
    models: BTreeMap<String, Arc<ResolvedProvider>>,
    version: u64,
    built_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Build a snapshot from configurations.
    ///
    /// Disabled configurations and kind `none` are skipped. When two
    /// configurations share a model key the later one wins and the earlier
    /// one is silently unreachable; a warning is logged for each shadowing.
    pub fn build(configs: Vec<ProviderConfig>) -> Self {
        Self::build_versioned(configs, 0)
    }

    fn build_versioned(configs: Vec<ProviderConfig>, version: u64) -> Self {
        let mut models = BTreeMap::new();

        for config in configs {
            if !config.enabled || config.kind == ProviderKind::None {
                continue;
            }
            let resolved = ResolvedProvider::resolve(config);
            if let Some(shadowed) = models.insert(resolved.model_key.clone(), Arc::new(resolved)) {
                tracing::warn!(
                    model = %shadowed.model_key,
                    shadowed_provider = %shadowed.config.id,
                    "Duplicate model key; earlier provider is shadowed"
                );
            }
        }

        Self {
            models,
            version,
            built_at: Utc::now(),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<ResolvedProvider>> {
        self.models.get(key).cloned()
    }

    /// All routable providers ordered by model key.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResolvedProvider>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Monotonic counter, bumped on each successful reload.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Copy)]
pub struct ReloadSummary {
    pub models: usize,
    pub version: u64,
}

/// Publishes registry snapshots built from a [`ConfigSource`].
pub struct ConfigRegistry {
    source: Arc<dyn ConfigSource>,
    current: ArcSwap<RegistrySnapshot>,
}

impl ConfigRegistry {
    /// Load the initial snapshot from `source`.
    pub fn load(source: Arc<dyn ConfigSource>) -> Result<Self, ConfigError> {
        let configs = source.enabled_configs()?;
        let snapshot = RegistrySnapshot::build_versioned(configs, 1);
        tracing::info!(models = snapshot.len(), "Model registry loaded");
        Ok(Self {
            source,
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    /// Current snapshot. Hold on to the returned `Arc` for the whole request.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<ResolvedProvider>> {
        self.current.load().lookup(key)
    }

    /// Rebuild from the source and swap the new snapshot in.
    ///
    /// On error the previous snapshot stays published.
    pub fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let configs = self.source.enabled_configs()?;
        let version = self.current.load().version() + 1;
        let snapshot = Arc::new(RegistrySnapshot::build_versioned(configs, version));
        let summary = ReloadSummary {
            models: snapshot.len(),
            version,
        };
        self.current.store(snapshot);

        tracing::info!(
            models = summary.models,
            version = summary.version,
            "Model registry reloaded"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("current", &self.current.load_full())
            .finish()
    }
}
