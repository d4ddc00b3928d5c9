//! Host state shared by every call.
//!
//! A [`Host`] owns the base plugin manager, the tenant database and the
//! configuration. Calls never run on the base manager: each one gets an
//! isolated copy, so plugin globals written by one call are invisible to the
//! next. Plugin code recurses on the native stack, so it never runs on tokio's
//! threads: every call gets its own thread sized for the engine's call depth
//! cap.

use crate::config::Config;
use anyhow::{anyhow, Context as _, Result};
use gantry_plugin_api::{Context, Database, PluginManager};
use gantry_runtime::{discover_plugins, DirFileSystem, FileSystem, Value, CALL_STACK_SIZE};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Run `f` on a thread with [`CALL_STACK_SIZE`] bytes of stack.
fn spawn_call<T, F>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name("gantry-call".to_string())
        .stack_size(CALL_STACK_SIZE)
        .spawn(f)
        .context("Failed to spawn call thread")
}

fn run_isolated(
    mut ctx: Context,
    manager: &PluginManager,
    function: &str,
    args: &[serde_json::Value],
) -> Result<Value> {
    ctx.manager = Some(manager.isolate(&ctx)?);
    let args = args.iter().map(Value::from_json).collect();
    Ok(ctx.exec(function, args)?)
}

/// A call on behalf of a tenant.
#[derive(Debug, Clone)]
pub struct Call {
    pub tenant: String,
    pub function: String,
    pub args: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct Host {
    config: Arc<Config>,
    manager: PluginManager,
    db: Database,
}

impl Host {
    /// Open the plugin directory and database named by the configuration.
    pub fn open(config: Config) -> Result<Self> {
        let dir = config.plugins_dir()?;
        let fs: Arc<dyn FileSystem> = Arc::new(DirFileSystem::new(dir.clone()));
        let manager = PluginManager::new(Some(fs), config.manager_config());

        let db = match &config.database.path {
            Some(path) => Database::open(path)
                .with_context(|| format!("Failed to open database: {}", path.display()))?,
            None => Database::open_in_memory().context("Failed to open in-memory database")?,
        };

        info!("Plugins directory: {}", dir.display());
        Ok(Self::with_parts(config, manager, db))
    }

    pub fn with_parts(config: Config, manager: PluginManager, db: Database) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            db,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Load plugins into the base manager. Failures are logged and skipped.
    pub fn prewarm(&self, names: &[String]) -> Result<usize> {
        let ctx = Context::new("system")
            .with_manager(self.manager.clone())
            .with_plugins(names.iter().cloned())
            .with_db(self.db.session());
        let manager = self.manager.clone();
        let names = names.to_vec();

        spawn_call(move || {
            let mut loaded = 0;
            for name in &names {
                match manager.load_plugin(&ctx, name) {
                    Ok(_) => loaded += 1,
                    Err(e) => warn!(plugin = %name, "Failed to prewarm plugin: {}", e),
                }
            }
            loaded
        })?
        .join()
        .map_err(|_| anyhow!("Prewarm panicked"))
    }

    /// Prewarm every compiled plugin in the plugins directory.
    pub fn prewarm_discovered(&self) -> Result<usize> {
        let dir = self.config.plugins_dir()?;
        let names: Vec<String> = discover_plugins(&dir)
            .with_context(|| format!("Failed to scan plugins directory: {}", dir.display()))?
            .into_iter()
            .map(|p| p.name)
            .collect();
        self.prewarm(&names)
    }

    /// Context for a tenant, bound to the base manager and a fresh database
    /// session.
    pub fn context(&self, tenant: &str) -> Result<Context> {
        let config = self.config.tenant(tenant)?;
        Ok(config.context(tenant, self.manager.clone(), self.db.session()))
    }

    /// Run `plugin.function` for a tenant on an isolated manager.
    pub async fn call(
        &self,
        tenant: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let ctx = self.context(tenant)?;
        let manager = self.manager.clone();
        let function = function.to_string();
        debug!(tenant = %tenant, function = %function, "Dispatching call");

        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_call(move || {
            let _ = tx.send(run_isolated(ctx, &manager, &function, &args));
        })?;
        let value = rx.await.context("Plugin call panicked")??;

        Ok(value.to_json())
    }

    /// Run calls concurrently. Results are returned in call order.
    pub async fn call_all(&self, calls: Vec<Call>) -> Vec<Result<serde_json::Value>> {
        let handles: Vec<_> = calls
            .into_iter()
            .map(|call| {
                let host = self.clone();
                tokio::spawn(async move { host.call(&call.tenant, &call.function, call.args).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::Error::new(e).context("Call task failed")),
            });
        }
        results
    }
}
