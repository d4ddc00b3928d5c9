//! Per-call execution context.
//!
//! A [`Context`] is threaded through every VM invocation as the VM's host
//! context. Each cross-plugin call runs on its own clone (see
//! [`Context::for_call`]) so a nested call cannot alter the caller's locale,
//! clock or plugin list. The item bags are shared between clones.

use crate::db::Database;
use crate::error::{PluginError, PluginResult};
use crate::manager::{default_manager, PluginManager};
use crate::plugin::Plugin;
use chrono::{DateTime, Utc};
use gantry_runtime::{FileSystem, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type ItemBag = Arc<RwLock<HashMap<String, Value>>>;

/// Execution state of a call.
#[derive(Debug, Clone)]
pub struct Context {
    /// Unique id of the top-level request.
    pub guid: String,
    pub tenant: String,
    pub tenant_label: String,
    pub tenant_icon: String,
    /// Culture requested by the user, if any.
    pub user_culture: String,
    pub culture: String,
    /// IANA timezone name.
    pub location: String,

    /// Plugin currently executing, `None` for host code.
    pub plugin: Option<Arc<Plugin>>,
    /// Plugin that initiated the current call.
    pub caller: Option<Arc<Plugin>>,
    pub manager: Option<PluginManager>,
    /// Plugins the tenant has installed, in activation order.
    pub plugins: Vec<String>,

    pub db: Option<Database>,
    pub data_fs: Option<Arc<dyn FileSystem>>,
    items: ItemBag,
    protected_items: ItemBag,

    /// Fixed clock, for tests.
    pub now: Option<DateTime<Utc>>,
    pub debug: bool,
    pub test: bool,
    pub mono_tenant: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            tenant: String::new(),
            tenant_label: String::new(),
            tenant_icon: String::new(),
            user_culture: String::new(),
            culture: "en-US".to_string(),
            location: "UTC".to_string(),
            plugin: None,
            caller: None,
            manager: None,
            plugins: Vec::new(),
            db: None,
            data_fs: None,
            items: ItemBag::default(),
            protected_items: ItemBag::default(),
            now: None,
            debug: false,
            test: false,
            mono_tenant: false,
        }
    }
}

impl Context {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    pub fn with_manager(mut self, manager: PluginManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_plugins(plugins);
        self
    }

    pub fn with_db(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_data_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.data_fs = Some(fs);
        self
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = culture.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Context for a call made from this one: the current plugin becomes the
    /// caller.
    pub fn for_call(&self) -> Context {
        let mut child = self.clone();
        child.caller = self.plugin.clone();
        child
    }

    /// Name of the running plugin.
    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin.as_deref().map(Plugin::name)
    }

    pub fn caller_name(&self) -> Option<&str> {
        self.caller.as_deref().map(Plugin::name)
    }

    /// Current time, honoring the fixed clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Activate a plugin for the tenant. Adding twice is a no-op.
    pub fn add_plugin(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.has_plugin(&name) {
            self.plugins.push(name);
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p == name)
    }

    pub fn get_plugins(&self) -> &[String] {
        &self.plugins
    }

    pub fn set_plugins<I, S>(&mut self, plugins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = plugins.into_iter().map(Into::into).collect();
    }

    /// Value of a script-visible item.
    pub fn item(&self, key: &str) -> Option<Value> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Value of a host-only item. Missing keys read as an empty string.
    pub fn protected_item(&self, key: &str) -> Value {
        self.protected_items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()))
    }

    pub fn set_protected_item(&self, key: impl Into<String>, value: Value) {
        self.protected_items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// The context's manager, falling back to the process-wide default.
    pub fn manager(&self) -> PluginResult<PluginManager> {
        self.manager
            .clone()
            .or_else(default_manager)
            .ok_or(PluginError::NoPluginManager)
    }

    /// Run `plugin.function` through the context's manager.
    pub fn exec(&self, name: &str, args: Vec<Value>) -> PluginResult<Value> {
        self.manager()?.exec(self, name, args)
    }

    /// Like [`Context::exec`], but a missing plugin or function yields `None`.
    pub fn exec_if_exists(&self, name: &str, args: Vec<Value>) -> PluginResult<Option<Value>> {
        self.manager()?.exec_if_exists(self, name, args)
    }
}
