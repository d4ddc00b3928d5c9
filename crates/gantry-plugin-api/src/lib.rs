//! # gantry-plugin-api
//!
//! Plugin sandbox and multi-tenant execution runtime.
//!
//! Plugins are compiled programs run by [`gantry_runtime`]. The
//! [`PluginManager`] loads them lazily by name, caches one instance per path
//! and runs their functions on behalf of a tenant described by a
//! [`Context`]:
//!
//! - only plugins listed in the tenant's context can be executed
//! - a running plugin sees the tenant database confined to its own namespace
//!   unless its directives ask for more
//! - every nested call shares the step and allocation budget of the call
//!   that started it
//! - plugins publish and subscribe to named hooks within their namespace
//!
//! ## Example
//!
//! ```no_run
//! use gantry_plugin_api::{Context, ManagerConfig, PluginManager};
//! use gantry_runtime::{DirFileSystem, Value};
//! use std::sync::Arc;
//!
//! let fs = Arc::new(DirFileSystem::new("/var/lib/gantry/plugins"));
//! let manager = PluginManager::new(Some(fs), ManagerConfig::default());
//! let ctx = Context::new("acme")
//!     .with_manager(manager)
//!     .with_plugins(["greeter"]);
//!
//! let reply = ctx.exec("greeter.greet", vec![Value::from("world")])?;
//! println!("{}", reply);
//! # Ok::<(), gantry_plugin_api::PluginError>(())
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod host;
pub mod manager;
pub mod plugin;
pub mod registry;

pub use config::{Limits, ManagerConfig};
pub use context::Context;
pub use db::{Database, DbScope, ScopeGuard};
pub use error::{PluginError, PluginResult};
pub use manager::{default_manager, init_default_manager, parse_function_name, PluginManager};
pub use plugin::{Plugin, PluginPermissions};
pub use registry::{HookFunction, HookTable, Registry};
