//! Tenant configuration and execution contexts.

use anyhow::Result;
use gantry_plugin_api::{Context, Database, PluginManager};
use gantry_runtime::is_identifier;
use serde::{Deserialize, Serialize};

/// A tenant and the plugins it has installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TenantConfig {
    /// Display name
    pub label: String,
    pub icon: String,
    /// Default: "en-US"
    pub culture: String,
    /// IANA timezone name
    /// Default: "UTC"
    pub timezone: String,
    /// Installed plugins, in activation order
    pub plugins: Vec<String>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            icon: String::new(),
            culture: "en-US".to_string(),
            timezone: "UTC".to_string(),
            plugins: Vec::new(),
        }
    }
}

impl TenantConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.plugins.iter().find(|p| !is_identifier(p)) {
            anyhow::bail!("Invalid plugin name: {}", bad);
        }
        Ok(())
    }

    /// Build the context a call on behalf of this tenant runs in.
    pub fn context(&self, name: &str, manager: PluginManager, db: Database) -> Context {
        let mut ctx = Context::new(name)
            .with_manager(manager)
            .with_plugins(self.plugins.iter().cloned())
            .with_db(db)
            .with_culture(self.culture.clone())
            .with_location(self.timezone.clone());
        ctx.tenant_label = if self.label.is_empty() {
            name.to_string()
        } else {
            self.label.clone()
        };
        ctx.tenant_icon = self.icon.clone();
        ctx
    }
}
