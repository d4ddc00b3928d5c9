//! Plugin and hook tables owned by a plugin manager.
//!
//! Hook subscribers are stored as `(plugin name, function index)` pairs and
//! resolved against the plugin table only when a hook fires, so a reload
//! swaps the implementation without fixing up references.

use crate::plugin::Plugin;
use std::collections::HashMap;
use std::sync::Arc;

/// A hook subscriber: a function of a plugin, by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFunction {
    pub plugin: String,
    pub function: usize,
}

/// Hook name to ordered subscribers.
pub type HookTable = HashMap<String, Vec<HookFunction>>;

/// Loaded plugins keyed by path, plus the hook table.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    plugins: HashMap<String, Arc<Plugin>>,
    hooks: HookTable,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Plugin>> {
        self.plugins.get(path).cloned()
    }

    /// Publish a plugin, replacing any previous one at the same path.
    pub fn insert(&mut self, plugin: Arc<Plugin>) -> Option<Arc<Plugin>> {
        self.plugins.insert(plugin.path().to_string(), plugin)
    }

    pub fn remove(&mut self, path: &str) -> Option<Arc<Plugin>> {
        self.plugins.remove(path)
    }

    /// Loaded plugins sorted by name.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        let mut plugins: Vec<_> = self.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Drop every plugin and hook.
    pub fn clear(&mut self) {
        self.plugins.clear();
        self.hooks.clear();
    }

    pub fn add_hook(&mut self, name: impl Into<String>, hook: HookFunction) {
        self.hooks.entry(name.into()).or_default().push(hook);
    }

    /// Subscribers of a hook, in subscription order.
    pub fn hooks(&self, name: &str) -> Vec<HookFunction> {
        self.hooks.get(name).cloned().unwrap_or_default()
    }

    pub fn any_hook(&self, name: &str) -> bool {
        self.hooks.get(name).is_some_and(|h| !h.is_empty())
    }

    /// Remove every subscription owned by a plugin.
    pub fn remove_hooks_of(&mut self, plugin: &str) -> usize {
        let mut removed = 0;
        self.hooks.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|h| h.plugin != plugin);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    pub fn hook_table(&self) -> &HookTable {
        &self.hooks
    }

    pub fn set_hook_table(&mut self, hooks: HookTable) {
        self.hooks = hooks;
    }
}
