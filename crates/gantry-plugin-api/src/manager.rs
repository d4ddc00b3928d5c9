//! Plugin manager: loading, execution and hooks.
//!
//! The registry mutex is held only around table reads and writes. Module
//! init and function calls run unlocked, so a running call may re-enter the
//! manager (nested exec, hook dispatch, lazy loads). Loads of one path are
//! serialized through a per-path claim; a thread that asks for a path it is
//! already loading gets [`PluginError::CircularLoad`].
//!
//! Every call runs on a forked budget that is folded back into the caller's
//! budget when the call returns, so a chain of nested calls shares one
//! advancing step counter.

use crate::config::ManagerConfig;
use crate::context::Context;
use crate::error::{PluginError, PluginResult};
use crate::host;
use crate::plugin::Plugin;
use crate::registry::{HookFunction, Registry};
use gantry_runtime::{
    is_identifier, plugin_name, plugin_path, Budget, FileSystem, Globals, Natives, Program,
    RuntimeError, Value, Vm,
};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use tracing::{debug, info, trace, warn};

static DEFAULT_MANAGER: OnceLock<PluginManager> = OnceLock::new();

/// Install the process-wide default manager. Fails if one is already set.
pub fn init_default_manager(manager: PluginManager) -> PluginResult<()> {
    DEFAULT_MANAGER
        .set(manager)
        .map_err(|_| PluginError::AlreadyInitialized)?;
    info!("Initialized default plugin manager");
    Ok(())
}

/// The process-wide default manager, if initialized.
pub fn default_manager() -> Option<PluginManager> {
    DEFAULT_MANAGER.get().cloned()
}

/// Split `plugin.function`. Empty segments are ignored.
pub fn parse_function_name(name: &str) -> PluginResult<(&str, &str)> {
    let parts: Vec<&str> = name.split('.').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [plugin, function] => Ok((*plugin, *function)),
        _ => Err(PluginError::InvalidFunctionName(name.to_string())),
    }
}

fn checked_path(name: &str) -> PluginResult<String> {
    if !is_identifier(name) {
        return Err(PluginError::InvalidPluginName(name.to_string()));
    }
    Ok(plugin_path(name))
}

/// Hooks fired from inside a plugin must use that plugin's namespace.
fn validate_hook_name(ctx: &Context, name: &str) -> PluginResult<()> {
    if let Some(plugin) = ctx.plugin_name() {
        let owned = name
            .strip_prefix(plugin)
            .is_some_and(|rest| rest.starts_with('.'));
        if !owned {
            warn!(hook = %name, plugin = %plugin, "Rejected hook outside plugin namespace");
            return Err(PluginError::InvalidHookName(name.to_string()));
        }
    }
    Ok(())
}

enum Source {
    /// Cached plugin, or read it from the filesystem.
    Storage,
    /// Drop the cached plugin and its hooks, then read it again.
    Reload,
    /// Initialize a program the caller already holds.
    Program(Arc<Program>),
}

struct ManagerInner {
    registry: Mutex<Registry>,
    loading: Mutex<HashMap<String, ThreadId>>,
    load_finished: Condvar,
    fs: Option<Arc<dyn FileSystem>>,
    config: RwLock<ManagerConfig>,
    natives: Arc<Natives<Context>>,
}

/// Marks a path as being loaded by the current thread until dropped.
struct LoadClaim<'a> {
    manager: &'a PluginManager,
    path: String,
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        self.manager.loading().remove(&self.path);
        self.manager.inner.load_finished.notify_all();
    }
}

/// Registry of loaded plugins and their hooks. Cloning yields another handle
/// to the same manager; see [`PluginManager::isolate`] and
/// [`PluginManager::copy`] for independent managers.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plugins = self.inner.registry.try_lock().map(|r| r.len()).ok();
        f.debug_struct("PluginManager")
            .field("plugins", &plugins)
            .field("config", &self.config())
            .finish()
    }
}

impl PluginManager {
    /// Create a manager with the default host bindings.
    pub fn new(fs: Option<Arc<dyn FileSystem>>, config: ManagerConfig) -> Self {
        Self::with_natives(fs, config, host::natives())
    }

    /// Create a manager with a custom native table.
    pub fn with_natives(
        fs: Option<Arc<dyn FileSystem>>,
        config: ManagerConfig,
        natives: Natives<Context>,
    ) -> Self {
        Self::from_parts(fs, config, Arc::new(natives), Registry::new())
    }

    fn from_parts(
        fs: Option<Arc<dyn FileSystem>>,
        config: ManagerConfig,
        natives: Arc<Natives<Context>>,
        registry: Registry,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(registry),
                loading: Mutex::new(HashMap::new()),
                load_finished: Condvar::new(),
                fs,
                config: RwLock::new(config),
                natives,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loading(&self) -> MutexGuard<'_, HashMap<String, ThreadId>> {
        self.inner.loading.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when both handles refer to the same manager.
    pub fn ptr_eq(&self, other: &PluginManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn file_system(&self) -> Option<&Arc<dyn FileSystem>> {
        self.inner.fs.as_ref()
    }

    pub fn natives(&self) -> &Arc<Natives<Context>> {
        &self.inner.natives
    }

    pub fn config(&self) -> ManagerConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn debug(&self) -> bool {
        self.config().debug
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .debug = debug;
    }

    pub fn plugins_dir(&self) -> String {
        self.config().plugins_dir
    }

    pub fn set_plugins_dir(&self, dir: impl Into<String>) {
        self.inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins_dir = dir.into();
    }

    /// Fresh budget for a call started by host code.
    pub fn budget(&self) -> Budget {
        self.config().limits.budget()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load a plugin by name, or return the cached one.
    pub fn load_plugin(&self, ctx: &Context, name: &str) -> PluginResult<Arc<Plugin>> {
        let mut budget = self.budget();
        self.load_plugin_with_budget(ctx, name, &mut budget)
    }

    pub fn load_plugin_with_budget(
        &self,
        ctx: &Context,
        name: &str,
        budget: &mut Budget,
    ) -> PluginResult<Arc<Plugin>> {
        let path = checked_path(name)?;
        self.load_path(ctx, &path, Source::Storage, budget)
    }

    /// Initialize a plugin built in memory and register it at its path,
    /// replacing any plugin already there.
    pub fn load_plugin_value(&self, ctx: &Context, plugin: Plugin) -> PluginResult<Arc<Plugin>> {
        let mut budget = self.budget();
        self.load_plugin_value_with_budget(ctx, plugin, &mut budget)
    }

    pub fn load_plugin_value_with_budget(
        &self,
        ctx: &Context,
        plugin: Plugin,
        budget: &mut Budget,
    ) -> PluginResult<Arc<Plugin>> {
        let source = Source::Program(Arc::clone(plugin.program()));
        self.load_path(ctx, plugin.path(), source, budget)
    }

    /// Drop a plugin and its hook subscriptions, then load it again.
    pub fn reload_plugin(&self, ctx: &Context, name: &str) -> PluginResult<Arc<Plugin>> {
        let mut budget = self.budget();
        self.reload_plugin_with_budget(ctx, name, &mut budget)
    }

    pub fn reload_plugin_with_budget(
        &self,
        ctx: &Context,
        name: &str,
        budget: &mut Budget,
    ) -> PluginResult<Arc<Plugin>> {
        let path = checked_path(name)?;
        self.load_path(ctx, &path, Source::Reload, budget)
    }

    /// Drop one plugin and its hooks, or everything when `name` is `None`.
    pub fn clear(&self, name: Option<&str>) -> PluginResult<()> {
        match name {
            None => {
                self.registry().clear();
                info!("Cleared all plugins");
            }
            Some(name) => {
                let path = checked_path(name)?;
                let mut registry = self.registry();
                registry.remove(&path);
                let hooks = registry.remove_hooks_of(name);
                info!(plugin = %name, hooks, "Cleared plugin");
            }
        }
        Ok(())
    }

    /// A loaded plugin, without loading it.
    pub fn get_plugin(&self, name: &str) -> PluginResult<Option<Arc<Plugin>>> {
        let path = checked_path(name)?;
        Ok(self.registry().get(&path))
    }

    /// Every loaded plugin, sorted by name.
    pub fn all_plugins(&self) -> Vec<Arc<Plugin>> {
        self.registry().plugins()
    }

    fn load_path(
        &self,
        ctx: &Context,
        path: &str,
        source: Source,
        budget: &mut Budget,
    ) -> PluginResult<Arc<Plugin>> {
        if matches!(source, Source::Storage) {
            if let Some(plugin) = self.registry().get(path) {
                return Ok(plugin);
            }
        }

        let _claim = self.claim(path)?;

        let name = plugin_name(path)
            .ok_or_else(|| PluginError::InvalidPluginName(path.to_string()))?
            .to_string();

        let program = match source {
            Source::Storage => {
                // another thread may have finished this load while we waited
                if let Some(plugin) = self.registry().get(path) {
                    return Ok(plugin);
                }
                self.read_program(&name, path)?
            }
            Source::Reload => {
                let mut registry = self.registry();
                registry.remove(path);
                let hooks = registry.remove_hooks_of(&name);
                drop(registry);
                debug!(plugin = %name, hooks, "Dropped plugin for reload");
                self.read_program(&name, path)?
            }
            Source::Program(program) => {
                self.registry().remove_hooks_of(&name);
                program
            }
        };

        let plugin = self.initialize(ctx, name, path, program, budget)?;
        self.registry().insert(Arc::clone(&plugin));
        info!(plugin = %plugin.name(), path = %path, "Loaded plugin");
        Ok(plugin)
    }

    fn claim(&self, path: &str) -> PluginResult<LoadClaim<'_>> {
        let me = thread::current().id();
        let mut loading = self.loading();

        while let Some(owner) = loading.get(path) {
            if *owner == me {
                warn!(path = %path, "Circular plugin load");
                return Err(PluginError::CircularLoad(path.to_string()));
            }
            loading = self
                .inner
                .load_finished
                .wait(loading)
                .unwrap_or_else(PoisonError::into_inner);
        }

        loading.insert(path.to_string(), me);
        Ok(LoadClaim {
            manager: self,
            path: path.to_string(),
        })
    }

    fn read_program(&self, name: &str, path: &str) -> PluginResult<Arc<Program>> {
        let fs = self.inner.fs.as_ref().ok_or(PluginError::NoFileSystem)?;
        let config = self.config();

        let result = if config.debug {
            let source = config.source_path(name);
            debug!(plugin = %name, source = %source, "Compiling plugin from source");
            fs.open(&source)
                .map_err(RuntimeError::from)
                .and_then(|bytes| Program::compile(&bytes))
        } else {
            fs.open(path)
                .map_err(RuntimeError::from)
                .and_then(|bytes| Program::deserialize(&bytes))
        };

        result
            .map(Arc::new)
            .map_err(|source| PluginError::PluginLoadError {
                path: path.to_string(),
                source,
            })
    }

    /// Run a program's module init and build the plugin around its globals.
    /// Init runs under the same namespace and elevation rules as a call.
    fn initialize(
        &self,
        ctx: &Context,
        name: String,
        path: &str,
        program: Arc<Program>,
        budget: &mut Budget,
    ) -> PluginResult<Arc<Plugin>> {
        let globals = Globals::new(program.global_count());
        let plugin = Arc::new(Plugin::with_globals(
            name,
            path.to_string(),
            Arc::clone(&program),
            globals.clone(),
        ));

        let mut child = ctx.for_call();
        child.plugin = Some(Arc::clone(&plugin));
        child.manager = Some(self.clone());
        let db = child.db.clone();
        let _scope = db.as_ref().map(|db| db.enter(plugin.db_scope()));

        let mut vm = Vm::new(program, Arc::clone(&self.inner.natives), child)
            .with_globals(globals)
            .with_budget(budget.fork());
        let entry = vm.program().entry_point();
        let result = vm.run_function(entry, Vec::new());
        budget.absorb(&vm.budget);
        trace!(plugin = %plugin.name(), steps = budget.steps, "Ran module init");

        result.map_err(|source| PluginError::PluginLoadError {
            path: path.to_string(),
            source,
        })?;
        Ok(plugin)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run an exported `plugin.function` the tenant has installed, loading
    /// the plugin if needed.
    pub fn exec(&self, ctx: &Context, name: &str, args: Vec<Value>) -> PluginResult<Value> {
        let mut budget = self.budget();
        self.exec_with_budget(ctx, name, args, false, true, &mut budget)
            .map(Option::unwrap_or_default)
    }

    /// Like [`PluginManager::exec`], but a plugin that is not installed, not
    /// on storage, or lacks the function yields `None`.
    pub fn exec_if_exists(
        &self,
        ctx: &Context,
        name: &str,
        args: Vec<Value>,
    ) -> PluginResult<Option<Value>> {
        let mut budget = self.budget();
        self.exec_with_budget(ctx, name, args, true, true, &mut budget)
    }

    pub fn exec_with_budget(
        &self,
        ctx: &Context,
        name: &str,
        args: Vec<Value>,
        only_if_exists: bool,
        only_exported: bool,
        budget: &mut Budget,
    ) -> PluginResult<Option<Value>> {
        let (plugin_name, function) = parse_function_name(name)?;
        let path = checked_path(plugin_name)?;

        if !ctx.has_plugin(plugin_name) {
            if only_if_exists {
                return Ok(None);
            }
            return Err(PluginError::PluginNotInstalled(plugin_name.to_string()));
        }

        let plugin = match self.load_path(ctx, &path, Source::Storage, budget) {
            Ok(plugin) => plugin,
            Err(e) if only_if_exists && e.is_not_found() => {
                debug!(plugin = %plugin_name, "Plugin does not exist, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let info = match plugin.function(function) {
            Some(info) => info,
            None if only_if_exists => return Ok(None),
            None => return Err(PluginError::FunctionNotFound(name.to_string())),
        };

        if only_exported && !info.exported {
            return Err(PluginError::FunctionNotExported(name.to_string()));
        }

        debug!(plugin = %plugin_name, function = %function, "Executing plugin function");
        self.exec_function(ctx, &plugin, info.index, args, budget)
            .map(Some)
    }

    /// Run a function of a resolved plugin inside its sandbox: a derived
    /// context naming the plugin, the database confined to the plugin's
    /// namespace and elevated only as its directives declare, and a forked
    /// budget. The database scope is restored even when the call fails.
    pub fn exec_function(
        &self,
        ctx: &Context,
        plugin: &Arc<Plugin>,
        index: usize,
        args: Vec<Value>,
        budget: &mut Budget,
    ) -> PluginResult<Value> {
        let mut child = ctx.for_call();
        child.plugin = Some(Arc::clone(plugin));
        child.manager = Some(self.clone());
        let db = child.db.clone();
        let _scope = db.as_ref().map(|db| db.enter(plugin.db_scope()));

        let mut vm = Vm::new(
            Arc::clone(plugin.program()),
            Arc::clone(&self.inner.natives),
            child,
        )
        .with_globals(plugin.globals().clone())
        .with_budget(budget.fork());

        let result = vm.run_function(index, args);
        budget.absorb(&vm.budget);
        trace!(plugin = %plugin.name(), steps = budget.steps, "Propagated budget");

        result.map_err(PluginError::from)
    }

    /// Trusted fast path: run a function of an already loaded plugin with
    /// the given context as is. The function need not be exported.
    pub fn run_func(&self, ctx: &Context, name: &str, args: Vec<Value>) -> PluginResult<Value> {
        let mut budget = self.budget();
        self.run_func_with_budget(ctx, name, args, &mut budget)
    }

    pub fn run_func_with_budget(
        &self,
        ctx: &Context,
        name: &str,
        args: Vec<Value>,
        budget: &mut Budget,
    ) -> PluginResult<Value> {
        let (plugin_name, function) = parse_function_name(name)?;
        let path = checked_path(plugin_name)?;

        // No implicit load: this is reachable from module init.
        let plugin = self
            .registry()
            .get(&path)
            .ok_or_else(|| PluginError::PluginNotLoaded(plugin_name.to_string()))?;

        let info = plugin
            .function(function)
            .ok_or_else(|| PluginError::FunctionNotFound(name.to_string()))?;

        let mut vm = Vm::new(
            Arc::clone(plugin.program()),
            Arc::clone(&self.inner.natives),
            ctx.clone(),
        )
        .with_globals(plugin.globals().clone())
        .with_budget(budget.fork());

        let result = vm.run_function(info.index, args);
        budget.absorb(&vm.budget);
        result.map_err(PluginError::from)
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Subscribe a function of the running plugin to a hook.
    pub fn add_hook(&self, ctx: &Context, name: &str, function: usize) -> PluginResult<()> {
        let plugin = ctx.plugin.as_ref().ok_or(PluginError::NotInPlugin)?;

        if plugin.program().function(function).is_none() {
            return Err(PluginError::FunctionNotFound(format!(
                "{}#{}",
                plugin.name(),
                function
            )));
        }

        self.registry().add_hook(
            name,
            HookFunction {
                plugin: plugin.name().to_string(),
                function,
            },
        );
        debug!(hook = %name, plugin = %plugin.name(), "Added hook");
        Ok(())
    }

    /// Invoke every active subscriber of a hook in order. The first failing
    /// subscriber aborts the rest.
    pub fn exec_hook(&self, ctx: &Context, name: &str, args: Vec<Value>) -> PluginResult<()> {
        let mut budget = self.budget();
        self.exec_hook_with_budget(ctx, name, args, &mut budget)
    }

    pub fn exec_hook_with_budget(
        &self,
        ctx: &Context,
        name: &str,
        args: Vec<Value>,
        budget: &mut Budget,
    ) -> PluginResult<()> {
        validate_hook_name(ctx, name)?;

        let subscribers = self.registry().hooks(name);

        for hook in subscribers {
            if !ctx.has_plugin(&hook.plugin) {
                trace!(hook = %name, plugin = %hook.plugin, "Skipping inactive subscriber");
                continue;
            }

            let path = checked_path(&hook.plugin)?;
            let plugin = self
                .registry()
                .get(&path)
                .ok_or_else(|| PluginError::PluginNotLoaded(hook.plugin.clone()))?;

            debug!(hook = %name, plugin = %hook.plugin, "Dispatching hook");
            self.exec_function(ctx, &plugin, hook.function, args.clone(), budget)?;
        }

        Ok(())
    }

    /// True when the hook has at least one subscriber.
    pub fn any_hook(&self, name: &str) -> bool {
        self.registry().any_hook(name)
    }

    pub fn hooks(&self, name: &str) -> Vec<HookFunction> {
        self.registry().hooks(name)
    }

    // ------------------------------------------------------------------
    // Cloning
    // ------------------------------------------------------------------

    /// An independent manager with a fresh plugin for every cached path.
    ///
    /// Programs are reused without recompiling; each plugin gets new globals
    /// from its module init. Hook subscriptions are copied from this manager.
    pub fn isolate(&self, ctx: &Context) -> PluginResult<PluginManager> {
        let (plugins, hooks) = {
            let registry = self.registry();
            (registry.plugins(), registry.hook_table().clone())
        };

        let clone = Self::from_parts(
            self.inner.fs.clone(),
            self.config(),
            Arc::clone(&self.inner.natives),
            Registry::new(),
        );

        for plugin in &plugins {
            // an earlier init may have pulled this one in already
            if clone.registry().get(plugin.path()).is_some() {
                continue;
            }
            let mut budget = clone.budget();
            let source = Source::Program(Arc::clone(plugin.program()));
            clone.load_path(ctx, plugin.path(), source, &mut budget)?;
        }

        clone.registry().set_hook_table(hooks);
        debug!("Isolated {} plugins", plugins.len());
        Ok(clone)
    }

    /// An independent manager sharing this one's plugins and globals, with
    /// its own copy of the hook table.
    pub fn copy(&self) -> PluginManager {
        let registry = self.registry().clone();
        Self::from_parts(
            self.inner.fs.clone(),
            self.config(),
            Arc::clone(&self.inner.natives),
            registry,
        )
    }
}
