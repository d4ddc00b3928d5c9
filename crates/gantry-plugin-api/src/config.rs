//! Plugin manager configuration.

use gantry_runtime::Budget;

/// Resource ceilings applied to every top-level call. 0 means unlimited;
/// call depth is always capped at [`gantry_runtime::MAX_CALL_DEPTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u64,
    pub max_allocations: u64,
    pub max_frames: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            max_allocations: 1_000_000,
            max_frames: 256,
        }
    }
}

impl Limits {
    pub fn unlimited() -> Self {
        Self {
            max_steps: 0,
            max_allocations: 0,
            max_frames: 0,
        }
    }

    /// A fresh budget with these ceilings.
    pub fn budget(&self) -> Budget {
        Budget::new(self.max_steps, self.max_allocations, self.max_frames)
    }
}

/// How a [`PluginManager`](crate::PluginManager) finds and runs plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Compile plugins from source on every load instead of reading
    /// compiled programs.
    pub debug: bool,

    /// Directory holding plugin sources, used in debug mode.
    pub plugins_dir: String,

    /// Ceilings for calls started by host code.
    pub limits: Limits,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            plugins_dir: "plugins".to_string(),
            limits: Limits::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_plugins_dir(mut self, dir: impl Into<String>) -> Self {
        self.plugins_dir = dir.into();
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Source path of a plugin in debug mode.
    pub fn source_path(&self, name: &str) -> String {
        let dir = self.plugins_dir.trim_end_matches('/');
        if dir.is_empty() {
            format!("{}/main.json", name)
        } else {
            format!("{}/{}/main.json", dir, name)
        }
    }
}
