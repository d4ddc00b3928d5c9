//! Loaded plugins.
//!
//! A [`Plugin`] is immutable once published: a reload builds a new value
//! and swaps it into the registry, so readers never see a half-updated
//! plugin. Only its [`Globals`] are shared mutable state.

use crate::db::DbScope;
use crate::error::{PluginError, PluginResult};
use gantry_runtime::{
    is_identifier, plugin_path, Capability, CapabilitySet, FunctionInfo, Globals, Program,
};
use std::sync::Arc;

/// What a plugin may do outside its own database namespace. Evaluated once
/// from the program's directives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginPermissions {
    pub trusted: bool,
    pub write_any_namespace: bool,
    pub open_any_database: bool,
}

impl PluginPermissions {
    pub fn from_capabilities(caps: &CapabilitySet) -> Self {
        Self {
            trusted: caps.is_trusted(),
            write_any_namespace: caps.has(&Capability::WriteAnyDatabaseNamespace),
            open_any_database: caps.has(&Capability::OpenAnyDatabase),
        }
    }
}

/// A program bound to a name, plus the globals produced by its module init.
#[derive(Debug)]
pub struct Plugin {
    name: String,
    path: String,
    program: Arc<Program>,
    globals: Globals,
    permissions: PluginPermissions,
}

impl Plugin {
    /// Build a plugin from a program held in memory. It has no state until a
    /// manager loads it.
    pub fn new(name: impl Into<String>, program: Arc<Program>) -> PluginResult<Self> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(PluginError::InvalidPluginName(name));
        }
        let path = plugin_path(&name);
        Ok(Self::with_globals(name, path, program, Globals::default()))
    }

    pub(crate) fn with_globals(
        name: String,
        path: String,
        program: Arc<Program>,
        globals: Globals,
    ) -> Self {
        let permissions = PluginPermissions::from_capabilities(program.capabilities());
        Self {
            name,
            path,
            program,
            globals,
            permissions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry key, `<name>.gt`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn permissions(&self) -> PluginPermissions {
        self.permissions
    }

    pub fn is_trusted(&self) -> bool {
        self.permissions.trusted
    }

    pub fn function(&self, name: &str) -> Option<FunctionInfo> {
        self.program.function_by_name(name)
    }

    /// Database scope a call into this plugin runs under.
    pub fn db_scope(&self) -> DbScope {
        DbScope {
            namespace: self.name.replace('.', ":"),
            write_any_namespace: self.permissions.trusted || self.permissions.write_any_namespace,
            open_any_database: self.permissions.trusted || self.permissions.open_any_database,
        }
    }
}
