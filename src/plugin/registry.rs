//! Explicit plugin registry
//!
//! Maps plugin identifiers to factories. Configuration entries are resolved
//! against it in declaration order, which becomes the invocation order for
//! every hook of the run.

use super::builtin;
use super::dispatch::{Plugin, PluginSet};
use super::hooks::ProxyPlugin;
use crate::config::PluginEntry;
use crate::error::{ConfigError, PluginError};
use crate::watch::WatchSet;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// What a factory gets to build its plugin from
pub struct PluginContext<'a> {
    pub name: &'a str,
    /// The entry's `config` payload, `Null` when absent
    pub config: &'a Value,
    /// Directory relative paths in the payload resolve against
    pub base_dir: &'a Path,
}

pub type PluginFactory =
    Arc<dyn Fn(&PluginContext<'_>) -> Result<Arc<dyn ProxyPlugin>, PluginError> + Send + Sync>;

/// Which front end the plugins are loaded for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Network,
    Stdio,
}

/// Result of resolving the configured plugin entries
#[derive(Debug, Clone)]
pub struct LoadedPlugins {
    pub plugins: PluginSet,
    /// Global watch set with every plugin's declared patterns merged in
    pub watch: WatchSet,
}

#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the plugins shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&PluginContext<'_>) -> Result<Arc<dyn ProxyPlugin>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Instantiate every enabled entry.
    ///
    /// Declared plugin patterns are merged into `global` first; a plugin that
    /// declares none then watches the complete merged set. Outside stdio mode
    /// a plugin left with no patterns at all is a configuration error.
    pub fn load(
        &self,
        entries: &[PluginEntry],
        global: WatchSet,
        mode: RunMode,
        base_dir: &Path,
    ) -> Result<LoadedPlugins, ConfigError> {
        let enabled: Vec<&PluginEntry> = entries.iter().filter(|e| e.enabled).collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoPlugins);
        }

        let mut merged = global;
        let mut declared: Vec<Option<WatchSet>> = Vec::with_capacity(enabled.len());
        for entry in &enabled {
            let own = match &entry.urls_to_watch {
                Some(urls) if !urls.is_empty() => {
                    let set = WatchSet::parse(urls)?;
                    merged.merge(&set);
                    Some(set)
                }
                _ => None,
            };
            declared.push(own);
        }

        let null = Value::Null;
        let mut plugins = Vec::with_capacity(enabled.len());
        for (entry, own) in enabled.into_iter().zip(declared) {
            let factory = self
                .factories
                .get(&entry.name)
                .ok_or_else(|| ConfigError::UnknownPlugin(entry.name.clone()))?;

            let watch = own.unwrap_or_else(|| merged.clone());
            if watch.is_empty() && mode == RunMode::Network {
                return Err(ConfigError::NoUrlsToWatch(entry.name.clone()));
            }

            let context = PluginContext {
                name: &entry.name,
                config: entry.config.as_ref().unwrap_or(&null),
                base_dir,
            };
            let hooks = factory(&context).map_err(|e| ConfigError::PluginConfig {
                name: entry.name.clone(),
                reason: e.to_string(),
            })?;

            debug!("Loaded plugin '{}' watching {} pattern(s)", entry.name, watch.len());
            plugins.push(Plugin::new(entry.name.clone(), watch, hooks));
        }

        info!(
            "Loaded {} plugin(s): {}",
            plugins.len(),
            plugins.iter().map(Plugin::name).collect::<Vec<_>>().join(", ")
        );

        Ok(LoadedPlugins {
            plugins: PluginSet::new(plugins),
            watch: merged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ProxyPlugin for Noop {}

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("noop", |_ctx: &PluginContext<'_>| {
            Ok(Arc::new(Noop) as Arc<dyn ProxyPlugin>)
        });
        registry
    }

    #[test]
    fn test_declared_patterns_merge_into_global() {
        let entries = vec![
            PluginEntry::new("noop").with_urls(["https://b.test/*"]),
            PluginEntry::new("noop"),
        ];
        let global = WatchSet::parse(["https://a.test/*"]).unwrap();
        let loaded = registry()
            .load(&entries, global, RunMode::Network, Path::new("."))
            .unwrap();

        assert_eq!(loaded.watch.len(), 2);
        let plugins = loaded.plugins.plugins();
        assert!(plugins[0].watches("https://b.test/x"));
        assert!(!plugins[0].watches("https://a.test/x"));
        // no declared patterns: the merged global set
        assert!(plugins[1].watches("https://a.test/x"));
        assert!(plugins[1].watches("https://b.test/x"));
    }

    #[test]
    fn test_empty_watch_set_is_fatal_only_outside_stdio() {
        let entries = vec![PluginEntry::new("noop")];

        let err = registry()
            .load(&entries, WatchSet::default(), RunMode::Network, Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoUrlsToWatch(name) if name == "noop"));

        let loaded = registry()
            .load(&entries, WatchSet::default(), RunMode::Stdio, Path::new("."))
            .unwrap();
        assert_eq!(loaded.plugins.len(), 1);
    }

    #[test]
    fn test_no_enabled_plugins_is_fatal() {
        let mut entry = PluginEntry::new("noop");
        entry.enabled = false;
        let err = registry()
            .load(&[entry], WatchSet::default(), RunMode::Stdio, Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoPlugins));
    }

    #[test]
    fn test_unknown_plugin_is_fatal() {
        let entries = vec![PluginEntry::new("missing")];
        let err = registry()
            .load(&entries, WatchSet::default(), RunMode::Stdio, Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPlugin(name) if name == "missing"));
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.contains("latency"));
        assert!(registry.contains("mock-response"));
    }
}
