//! Namespaced key/value database shared by the plugins of a tenant.
//!
//! One SQLite connection is multiplexed into per-plugin namespaces. The
//! handle carries a mutable [`DbScope`]; the plugin manager switches it to
//! the running plugin's namespace for the duration of a call and restores it
//! afterwards through a [`ScopeGuard`].
//!
//! # Database Schema
//!
//! - `kv`: `(namespace, key) -> value` with values stored as JSON
//! - `schema_version`: Migration tracking

use crate::error::{PluginError, PluginResult};
use chrono::Utc;
use gantry_runtime::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Namespace and cross-namespace permissions of a database handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbScope {
    /// Namespace used by unqualified reads and writes.
    pub namespace: String,
    /// Writes to other namespaces are allowed.
    pub write_any_namespace: bool,
    /// Reads from other namespaces are allowed.
    pub open_any_database: bool,
}

/// Cheaply cloneable database handle. Clones share the connection and the
/// scope; [`Database::session`] shares only the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    scope: Arc<Mutex<DbScope>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("scope", &self.scope())
            .finish()
    }
}

/// Restores the saved scope when dropped.
#[must_use = "the scope is restored as soon as the guard is dropped"]
pub struct ScopeGuard {
    db: Database,
    saved: DbScope,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.db.set_scope(std::mem::take(&mut self.saved));
    }
}

impl Database {
    /// Open the database at a path, creating it if it doesn't exist.
    pub fn open(path: &Path) -> PluginResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(gantry_runtime::RuntimeError::from)?;
        }

        info!("Opening database at: {:?}", path);
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> PluginResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PluginResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            scope: Arc::new(Mutex::new(DbScope::default())),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// A handle on the same connection with its own scope, starting from a
    /// copy of this one. Requests running concurrently need one each.
    pub fn session(&self) -> Database {
        Self {
            conn: Arc::clone(&self.conn),
            scope: Arc::new(Mutex::new(self.scope())),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scope_lock(&self) -> MutexGuard<'_, DbScope> {
        self.scope.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_migrations(&self) -> PluginResult<()> {
        let mut conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        debug!("Current schema version: {}", current_version);

        if current_version < 1 {
            info!("Running migration to schema version 1");
            let tx = conn.transaction()?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS kv (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, key)
                )",
                [],
            )?;
            tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
            tx.commit()?;
        }

        Ok(())
    }

    pub fn scope(&self) -> DbScope {
        self.scope_lock().clone()
    }

    /// Replace the scope, returning the previous one.
    pub fn set_scope(&self, scope: DbScope) -> DbScope {
        std::mem::replace(&mut *self.scope_lock(), scope)
    }

    /// Switch to `scope` until the returned guard is dropped.
    pub fn enter(&self, scope: DbScope) -> ScopeGuard {
        let saved = self.set_scope(scope);
        ScopeGuard {
            db: self.clone(),
            saved,
        }
    }

    pub fn namespace(&self) -> String {
        self.scope_lock().namespace.clone()
    }

    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.scope_lock().namespace = namespace.into();
    }

    pub fn write_any_namespace(&self) -> bool {
        self.scope_lock().write_any_namespace
    }

    pub fn set_write_any_namespace(&self, allowed: bool) {
        self.scope_lock().write_any_namespace = allowed;
    }

    pub fn open_any_database(&self) -> bool {
        self.scope_lock().open_any_database
    }

    pub fn set_open_any_database(&self, allowed: bool) {
        self.scope_lock().open_any_database = allowed;
    }

    /// Write a value in the current namespace.
    pub fn put(&self, key: &str, value: &Value) -> PluginResult<()> {
        let namespace = self.namespace();
        self.write(&namespace, key, value)
    }

    /// Write a value in `namespace`. Foreign namespaces need `write_any_namespace`.
    pub fn put_in(&self, namespace: &str, key: &str, value: &Value) -> PluginResult<()> {
        let scope = self.scope();
        if namespace != scope.namespace && !scope.write_any_namespace {
            return Err(PluginError::Unauthorized(format!(
                "cannot write to namespace '{}' from '{}'",
                namespace, scope.namespace
            )));
        }
        self.write(namespace, key, value)
    }

    /// Read a value from the current namespace.
    pub fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        let namespace = self.namespace();
        self.read(&namespace, key)
    }

    /// Read a value from `namespace`. Foreign namespaces need `open_any_database`.
    pub fn get_from(&self, namespace: &str, key: &str) -> PluginResult<Option<Value>> {
        let scope = self.scope();
        if namespace != scope.namespace && !scope.open_any_database {
            return Err(PluginError::Unauthorized(format!(
                "cannot read namespace '{}' from '{}'",
                namespace, scope.namespace
            )));
        }
        self.read(namespace, key)
    }

    /// Delete a key from the current namespace.
    pub fn delete(&self, key: &str) -> PluginResult<bool> {
        let namespace = self.namespace();
        let changed = self.conn().execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(changed > 0)
    }

    /// Keys of the current namespace, sorted.
    pub fn keys(&self) -> PluginResult<Vec<String>> {
        let namespace = self.namespace();
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![namespace], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn write(&self, namespace: &str, key: &str, value: &Value) -> PluginResult<()> {
        let json = serde_json::to_string(&value.to_json_exact()?)?;
        self.conn().execute(
            "INSERT INTO kv (namespace, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![namespace, key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn read(&self, namespace: &str, key: &str) -> PluginResult<Option<Value>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let json: serde_json::Value = serde_json::from_str(&raw)?;
                Ok(Some(Value::from_json(&json)))
            }
            None => Ok(None),
        }
    }
}
