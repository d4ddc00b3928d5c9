//! Error types for the plugin manager.

use gantry_runtime::RuntimeError;
use thiserror::Error;

/// Errors that can occur while loading or executing plugins.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Plugin name is not a valid identifier.
    #[error("Invalid plugin name: {0}")]
    InvalidPluginName(String),

    /// Qualified name is not `plugin.function`.
    #[error("Invalid function name, the format is plugin.function: {0}")]
    InvalidFunctionName(String),

    /// The tenant does not have the plugin in its active set.
    #[error("The plugin is not installed: {0}")]
    PluginNotInstalled(String),

    /// The plugin's program does not exist.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The plugin must already be loaded for this operation.
    #[error("Plugin not loaded: {0}")]
    PluginNotLoaded(String),

    /// The plugin exists but failed to compile or initialize.
    #[error("Error loading plugin {path}: {source}")]
    PluginLoadError {
        path: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function is not exported: {0}")]
    FunctionNotExported(String),

    /// Capability check failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Hook fired outside the calling plugin's namespace.
    #[error("Invalid hook name: {0}")]
    InvalidHookName(String),

    #[error("The current context is not a plugin")]
    NotInPlugin,

    #[error("There is no plugin manager set")]
    NoPluginManager,

    #[error("There is no filesystem set")]
    NoFileSystem,

    #[error("There is no database attached to the context")]
    NoDatabase,

    #[error("The default plugin manager is already initialized")]
    AlreadyInitialized,

    /// A plugin's module init requested its own load.
    #[error("Circular load of plugin {0}")]
    CircularLoad(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl PluginError {
    /// True when the plugin's program is missing, as opposed to broken.
    pub fn is_not_found(&self) -> bool {
        match self {
            PluginError::PluginNotFound(_) => true,
            PluginError::PluginLoadError { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Host errors raised inside natives travel through the VM boxed; unwrap
/// them so callers see the original error.
impl From<RuntimeError> for PluginError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Host(inner) => match inner.downcast::<PluginError>() {
                Ok(plugin_err) => *plugin_err,
                Err(other) => PluginError::Runtime(RuntimeError::Host(other)),
            },
            other => PluginError::Runtime(other),
        }
    }
}

impl From<PluginError> for RuntimeError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Runtime(inner) => inner,
            other => RuntimeError::Host(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::Runtime(RuntimeError::Json(err))
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = std::result::Result<T, PluginError>;
