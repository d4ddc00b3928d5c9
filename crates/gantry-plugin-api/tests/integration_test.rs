//! Integration tests for gantry-plugin-api.
//!
//! These tests cover:
//! - Lazy loading, caching, reload and clear
//! - Tenant gating and capability checks on host bindings
//! - Database namespace confinement across nested calls
//! - Hook subscription and dispatch
//! - Budgets shared by nested calls
//! - Isolated and copied managers

use gantry_plugin_api::{
    init_default_manager, Context, Database, DbScope, Limits, ManagerConfig, PluginError,
    PluginManager,
};
use gantry_runtime::bytecode::{Bytecode, BytecodeMetadata, Constant, Function, Instruction};
use gantry_runtime::{
    plugin_path, DirFileSystem, FileSystem, MemoryFileSystem, Program, RuntimeError, Value,
    CALL_STACK_SIZE, MAX_CALL_DEPTH,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

/// Minimal assembler for test programs. Every program has an `init` entry.
struct Asm {
    name: String,
    constants: Vec<Constant>,
    functions: Vec<Function>,
    global_count: usize,
    directives: BTreeMap<String, String>,
}

impl Asm {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constants: Vec::new(),
            functions: Vec::new(),
            global_count: 0,
            directives: BTreeMap::new(),
        }
    }

    fn globals(mut self, count: usize) -> Self {
        self.global_count = count;
        self
    }

    fn permissions(mut self, permissions: &str) -> Self {
        self.directives
            .insert("permissions".to_string(), permissions.to_string());
        self
    }

    /// Push a string constant and return the instruction loading it.
    fn str(&mut self, s: &str) -> Instruction {
        self.constants.push(Constant::String(s.to_string()));
        Instruction::LoadConst {
            index: self.constants.len() - 1,
        }
    }

    fn func(&mut self, name: &str, params: &[&str], exported: bool, code: Vec<Instruction>) {
        self.functions.push(Function {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            exported,
            local_count: params.len(),
            instructions: code,
        });
    }

    fn build(mut self) -> Bytecode {
        if !self.functions.iter().any(|f| f.name == "init") {
            self.func("init", &[], false, vec![Instruction::Return]);
        }
        Bytecode {
            version: 1,
            metadata: BytecodeMetadata {
                plugin_id: self.name,
                ..Default::default()
            },
            constants: self.constants,
            functions: self.functions,
            global_count: self.global_count,
            entry_point: "init".to_string(),
            directives: self.directives,
        }
    }
}

fn native(name: &str, arg_count: usize) -> Instruction {
    Instruction::CallNative {
        name: name.to_string(),
        arg_count,
    }
}

fn greeter() -> Bytecode {
    use Instruction::*;
    let mut a = Asm::new("greeter").globals(1);
    let hello = a.str("hello ");
    a.func("init", &[], false, vec![hello, StoreGlobal { index: 0 }, Return]);
    a.func(
        "greet",
        &["name"],
        true,
        vec![LoadGlobal { index: 0 }, LoadLocal { index: 0 }, Add, Return],
    );
    let secret = a.str("s3cr3t");
    a.func("secret", &[], false, vec![secret, Return]);
    a.build()
}

fn counter() -> Bytecode {
    use Instruction::*;
    let mut a = Asm::new("counter").globals(1);
    a.func(
        "init",
        &[],
        false,
        vec![MakeArray { count: 0 }, StoreGlobal { index: 0 }, Return],
    );
    a.func(
        "add",
        &["x"],
        true,
        vec![
            LoadGlobal { index: 0 },
            LoadLocal { index: 0 },
            native("push", 2),
            StoreGlobal { index: 0 },
            LoadGlobal { index: 0 },
            native("len", 1),
            Return,
        ],
    );
    a.func("items", &[], true, vec![LoadGlobal { index: 0 }, Return]);
    a.build()
}

/// Subscribes `on_saved` to `hook` during init, recording calls in the item
/// named after the plugin.
fn subscriber(name: &str, hook: &str) -> Bytecode {
    use Instruction::*;
    let mut a = Asm::new(name);
    let hook_name = a.str(hook);
    a.func(
        "init",
        &[],
        false,
        vec![
            hook_name,
            LoadFunction {
                name: "on_saved".to_string(),
            },
            native("plugins.addHook", 2),
            Return,
        ],
    );
    let item = a.str(name);
    a.func(
        "on_saved",
        &["x"],
        false,
        vec![item, LoadLocal { index: 0 }, native("context.setItem", 2), Return],
    );
    let fired = a.str(hook);
    a.func(
        "fire",
        &["x"],
        true,
        vec![fired, LoadLocal { index: 0 }, native("plugins.execHook", 2), Return],
    );
    a.build()
}

/// Exported functions `<name>(...)` that call one native with string args.
fn caller(name: &str, permissions: &str, calls: &[(&str, &str, &[&str])]) -> Bytecode {
    use Instruction::*;
    let mut a = Asm::new(name).permissions(permissions);
    for (function, native_name, args) in calls {
        let mut code: Vec<Instruction> = args.iter().map(|s| a.str(s)).collect();
        code.push(native(native_name, args.len()));
        code.push(Return);
        a.func(function, &[], true, code);
    }
    a.build()
}

fn notes() -> Bytecode {
    use Instruction::*;
    let mut a = Asm::new("notes");
    a.func(
        "save",
        &["k", "v"],
        true,
        vec![
            LoadLocal { index: 0 },
            LoadLocal { index: 1 },
            native("db.put", 2),
            Return,
        ],
    );
    a.func(
        "load",
        &["k"],
        true,
        vec![LoadLocal { index: 0 }, native("db.get", 1), Return],
    );
    a.func("ns", &[], true, vec![native("db.namespace", 0), Return]);
    let (other, key, value) = (a.str("other"), a.str("k"), a.str("v"));
    a.func(
        "steal",
        &[],
        true,
        vec![other, key, value, native("db.putIn", 3), Return],
    );
    let probe = a.str("probe.ns");
    a.func(
        "nested",
        &[],
        true,
        vec![
            probe,
            native("runtime.exec", 1),
            native("db.namespace", 0),
            MakeArray { count: 2 },
            Return,
        ],
    );
    a.build()
}

struct Fixture {
    fs: Arc<MemoryFileSystem>,
    manager: PluginManager,
    db: Database,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    fn with_config(config: ManagerConfig) -> Self {
        let fs = Arc::new(MemoryFileSystem::new());
        let manager = PluginManager::new(Some(fs.clone() as Arc<dyn FileSystem>), config);
        Self {
            fs,
            manager,
            db: Database::open_in_memory().unwrap(),
        }
    }

    fn install(&self, name: &str, bytecode: Bytecode) {
        let program = Program::new(bytecode).unwrap();
        self.fs
            .insert(plugin_path(name), program.to_binary().unwrap());
    }

    fn ctx(&self, plugins: &[&str]) -> Context {
        Context::new("acme")
            .with_manager(self.manager.clone())
            .with_plugins(plugins.iter().copied())
            .with_db(self.db.clone())
    }
}

// ==============================================================================
// Loading
// ==============================================================================

#[test]
fn test_exec_loads_lazily_and_caches() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let ctx = f.ctx(&["greeter"]);

    assert!(f.manager.get_plugin("greeter").unwrap().is_none());
    let reply = ctx.exec("greeter.greet", vec![Value::from("bob")]).unwrap();
    assert_eq!(reply, Value::from("hello bob"));

    let first = f.manager.get_plugin("greeter").unwrap().unwrap();
    let second = f.manager.load_plugin(&ctx, "greeter").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.globals().ptr_eq(second.globals()));
    assert_eq!(f.manager.all_plugins().len(), 1);
}

#[test]
fn test_concurrent_loads_share_one_instance() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let ctx = f.ctx(&["greeter"]);

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| f.manager.load_plugin(&ctx, "greeter").unwrap());
        let b = s.spawn(|| f.manager.load_plugin(&ctx, "greeter").unwrap());
        (a.join().unwrap(), b.join().unwrap())
    });
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_load_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let program = Program::new(greeter()).unwrap();
    std::fs::write(
        temp_dir.path().join(plugin_path("greeter")),
        program.to_binary().unwrap(),
    )
    .unwrap();

    let fs: Arc<dyn FileSystem> = Arc::new(DirFileSystem::new(temp_dir.path()));
    let manager = PluginManager::new(Some(fs), ManagerConfig::default());
    let ctx = Context::new("acme")
        .with_manager(manager)
        .with_plugins(["greeter"]);

    assert_eq!(
        ctx.exec("greeter.greet", vec![Value::from("disk")]).unwrap(),
        Value::from("hello disk")
    );
}

#[test]
fn test_debug_mode_compiles_source() {
    let f = Fixture::with_config(ManagerConfig::new().with_debug(true));
    f.fs.insert(
        "plugins/greeter/main.json",
        serde_json::to_vec(&greeter()).unwrap(),
    );
    let ctx = f.ctx(&["greeter"]);

    assert_eq!(
        ctx.exec("greeter.greet", vec![Value::from("src")]).unwrap(),
        Value::from("hello src")
    );

    f.manager.set_debug(false);
    f.manager.clear(None).unwrap();
    let err = ctx
        .exec("greeter.greet", vec![Value::from("src")])
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_reload_resets_globals() {
    let f = Fixture::new();
    f.install("counter", counter());
    let ctx = f.ctx(&["counter"]);

    ctx.exec("counter.add", vec![Value::Int(1)]).unwrap();
    ctx.exec("counter.add", vec![Value::Int(2)]).unwrap();
    let before = f.manager.get_plugin("counter").unwrap().unwrap();

    let after = f.manager.reload_plugin(&ctx, "counter").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(
        ctx.exec("counter.items", vec![]).unwrap(),
        Value::Array(vec![])
    );
    // the old instance keeps its own state
    assert_eq!(before.globals().get(0).unwrap().as_array().unwrap().len(), 2);
}

#[test]
fn test_counter_accumulates_across_calls() {
    let f = Fixture::new();
    f.install("counter", counter());
    let ctx = f.ctx(&["counter"]);

    let mut last = Value::Null;
    for i in 0..3 {
        last = ctx.exec("counter.add", vec![Value::Int(i)]).unwrap();
    }
    assert_eq!(last, Value::Int(3));
    assert_eq!(
        ctx.exec("counter.items", vec![]).unwrap(),
        Value::Array(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
    );
}

#[test]
fn test_clear() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    f.install("counter", counter());
    let ctx = f.ctx(&["greeter", "counter"]);
    f.manager.load_plugin(&ctx, "greeter").unwrap();
    f.manager.load_plugin(&ctx, "counter").unwrap();

    f.manager.clear(Some("greeter")).unwrap();
    assert!(f.manager.get_plugin("greeter").unwrap().is_none());
    assert!(f.manager.get_plugin("counter").unwrap().is_some());

    f.manager.clear(None).unwrap();
    assert!(f.manager.all_plugins().is_empty());
}

#[test]
fn test_load_plugin_value() {
    let f = Fixture::new();
    let ctx = f.ctx(&["greeter"]);
    let program = Arc::new(Program::new(greeter()).unwrap());
    let plugin = gantry_plugin_api::Plugin::new("greeter", program).unwrap();

    f.manager.load_plugin_value(&ctx, plugin).unwrap();
    assert_eq!(
        ctx.exec("greeter.greet", vec![Value::from("mem")]).unwrap(),
        Value::from("hello mem")
    );
}

#[test]
fn test_circular_init_is_rejected() {
    let f = Fixture::new();

    // init of a calls b, whose init calls back into a
    let mut a = Asm::new("a");
    let target = a.str("b.f");
    a.func(
        "init",
        &[],
        false,
        vec![target, native("runtime.exec", 1), Instruction::Return],
    );
    a.func("f", &[], true, vec![Instruction::Return]);
    f.install("a", a.build());

    let mut b = Asm::new("b");
    let target = b.str("a.f");
    b.func(
        "init",
        &[],
        false,
        vec![target, native("runtime.exec", 1), Instruction::Return],
    );
    b.func("f", &[], true, vec![Instruction::Return]);
    f.install("b", b.build());

    let ctx = f.ctx(&["a", "b"]);
    let err = f.manager.load_plugin(&ctx, "a").unwrap_err();
    assert!(matches!(err, PluginError::PluginLoadError { .. }));
    assert!(err.to_string().contains("Circular load"));
    assert!(f.manager.all_plugins().is_empty());
}

// ==============================================================================
// Execution and Gating
// ==============================================================================

#[test]
fn test_invalid_names() {
    let f = Fixture::new();
    let ctx = f.ctx(&["greeter"]);

    assert!(matches!(
        ctx.exec("greeter", vec![]),
        Err(PluginError::InvalidFunctionName(_))
    ));
    assert!(matches!(
        ctx.exec("bad-name.run", vec![]),
        Err(PluginError::InvalidPluginName(_))
    ));
    assert!(matches!(
        ctx.exec_if_exists("a.b.c", vec![]),
        Err(PluginError::InvalidFunctionName(_))
    ));
}

#[test]
fn test_inactive_plugin_is_not_executed() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let mut ctx = f.ctx(&[]);

    assert!(matches!(
        ctx.exec("greeter.greet", vec![Value::from("x")]),
        Err(PluginError::PluginNotInstalled(_))
    ));
    assert_eq!(
        ctx.exec_if_exists("greeter.greet", vec![Value::from("x")])
            .unwrap(),
        None
    );
    assert!(f.manager.all_plugins().is_empty());

    ctx.add_plugin("greeter");
    assert_eq!(
        ctx.exec("greeter.greet", vec![Value::from("x")]).unwrap(),
        Value::from("hello x")
    );
}

#[test]
fn test_missing_plugin() {
    let f = Fixture::new();
    f.install(
        "probe",
        caller("probe", "", &[("check", "runtime.execIfExists", &["ghost.run"])]),
    );
    let ctx = f.ctx(&["ghost", "probe"]);

    assert_eq!(ctx.exec_if_exists("ghost.run", vec![]).unwrap(), None);
    let err = ctx.exec("ghost.run", vec![]).unwrap_err();
    assert!(err.is_not_found());

    // the same from inside a plugin reads as null
    assert_eq!(ctx.exec("probe.check", vec![]).unwrap(), Value::Null);
}

#[test]
fn test_missing_function() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let ctx = f.ctx(&["greeter"]);

    assert!(matches!(
        ctx.exec("greeter.nope", vec![]),
        Err(PluginError::FunctionNotFound(_))
    ));
    assert_eq!(ctx.exec_if_exists("greeter.nope", vec![]).unwrap(), None);
    assert!(matches!(
        ctx.exec("greeter.secret", vec![]),
        Err(PluginError::FunctionNotExported(_))
    ));
}

#[test]
fn test_run_func_requires_loaded_plugin() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let ctx = f.ctx(&["greeter"]);

    assert!(matches!(
        f.manager.run_func(&ctx, "greeter.secret", vec![]),
        Err(PluginError::PluginNotLoaded(_))
    ));

    f.manager.load_plugin(&ctx, "greeter").unwrap();
    assert_eq!(
        f.manager.run_func(&ctx, "greeter.secret", vec![]).unwrap(),
        Value::from("s3cr3t")
    );
}

#[test]
fn test_untrusted_plugin_loads_only_active_plugins() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    f.install(
        "loader",
        caller("loader", "", &[("load", "plugins.load", &["greeter"])]),
    );

    let ctx = f.ctx(&["loader"]);
    assert!(matches!(
        ctx.exec("loader.load", vec![]),
        Err(PluginError::Unauthorized(_))
    ));

    let ctx = f.ctx(&["loader", "greeter"]);
    assert_eq!(
        ctx.exec("loader.load", vec![]).unwrap(),
        Value::from("greeter")
    );
}

#[test]
fn test_trusted_bindings() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    let calls: &[(&str, &str, &[&str])] = &[
        ("token", "runtime.getItem", &["token"]),
        ("secret", "runtime.exec", &["greeter.secret"]),
        ("run", "runtime.runFunc", &["greeter.secret"]),
        ("all", "plugins.all", &[]),
    ];
    f.install("admin", caller("admin", "trusted", calls));
    f.install("spy", caller("spy", "", calls));

    let ctx = f.ctx(&["admin", "spy", "greeter"]);
    ctx.set_protected_item("token", Value::from("t0k3n"));

    assert_eq!(ctx.exec("admin.token", vec![]).unwrap(), Value::from("t0k3n"));
    assert_eq!(ctx.exec("admin.secret", vec![]).unwrap(), Value::from("s3cr3t"));
    assert_eq!(ctx.exec("admin.run", vec![]).unwrap(), Value::from("s3cr3t"));
    assert!(matches!(
        ctx.exec("admin.all", vec![]).unwrap(),
        Value::Array(names) if names.contains(&Value::from("admin"))
    ));

    assert!(matches!(
        ctx.exec("spy.token", vec![]),
        Err(PluginError::Unauthorized(_))
    ));
    assert!(matches!(
        ctx.exec("spy.secret", vec![]),
        Err(PluginError::FunctionNotExported(_))
    ));
    assert!(matches!(
        ctx.exec("spy.run", vec![]),
        Err(PluginError::Unauthorized(_))
    ));
    assert!(matches!(
        ctx.exec("spy.all", vec![]),
        Err(PluginError::Unauthorized(_))
    ));
}

#[test]
fn test_context_bindings_see_caller() {
    let f = Fixture::new();
    f.install(
        "probe",
        caller(
            "probe",
            "",
            &[("who", "context.callerName", &[]), ("me", "context.pluginName", &[])],
        ),
    );
    f.install(
        "front",
        caller("front", "", &[("ask", "runtime.exec", &["probe.who"])]),
    );
    let ctx = f.ctx(&["probe", "front"]);

    assert_eq!(ctx.exec("probe.who", vec![]).unwrap(), Value::Null);
    assert_eq!(ctx.exec("probe.me", vec![]).unwrap(), Value::from("probe"));
    assert_eq!(ctx.exec("front.ask", vec![]).unwrap(), Value::from("front"));
}

#[test]
fn test_default_manager() {
    let f = Fixture::new();
    f.install("greeter", greeter());
    init_default_manager(f.manager.clone()).unwrap();

    let ctx = Context::new("acme").with_plugins(["greeter"]);
    assert_eq!(
        ctx.exec("greeter.greet", vec![Value::from("x")]).unwrap(),
        Value::from("hello x")
    );
    assert!(matches!(
        init_default_manager(f.manager.clone()),
        Err(PluginError::AlreadyInitialized)
    ));
}

// ==============================================================================
// Database Namespaces
// ==============================================================================

#[test]
fn test_plugin_writes_are_confined_to_its_namespace() {
    let f = Fixture::new();
    f.install("notes", notes());
    let ctx = f.ctx(&["notes"]);

    ctx.exec("notes.save", vec![Value::from("k"), Value::Int(7)])
        .unwrap();
    assert_eq!(
        ctx.exec("notes.load", vec![Value::from("k")]).unwrap(),
        Value::Int(7)
    );
    assert_eq!(ctx.exec("notes.ns", vec![]).unwrap(), Value::from("notes"));

    let _guard = f.db.enter(DbScope {
        namespace: "notes".to_string(),
        ..Default::default()
    });
    assert_eq!(f.db.get("k").unwrap(), Some(Value::Int(7)));
}

#[test]
fn test_foreign_namespace_needs_permission() {
    let f = Fixture::new();
    f.install("notes", notes());
    f.install(
        "admin",
        caller(
            "admin",
            "writeAnyDatabaseNamespace",
            &[("write", "db.putIn", &["other", "k", "v"])],
        ),
    );
    let ctx = f.ctx(&["notes", "admin"]);
    let host_scope = f.db.scope();

    let err = ctx.exec("notes.steal", vec![]).unwrap_err();
    assert!(matches!(err, PluginError::Unauthorized(_)));
    // scope is restored after a failed call
    assert_eq!(f.db.scope(), host_scope);

    ctx.exec("admin.write", vec![]).unwrap();
    assert_eq!(f.db.scope(), host_scope);
}

#[test]
fn test_nested_call_restores_namespace() {
    let f = Fixture::new();
    f.install("notes", notes());
    f.install("probe", caller("probe", "", &[("ns", "db.namespace", &[])]));
    let ctx = f.ctx(&["notes", "probe"]);

    assert_eq!(
        ctx.exec("notes.nested", vec![]).unwrap(),
        Value::Array(vec![Value::from("probe"), Value::from("notes")])
    );
}

#[test]
fn test_db_bindings_need_database() {
    let f = Fixture::new();
    f.install("notes", notes());
    let ctx = Context::new("acme")
        .with_manager(f.manager.clone())
        .with_plugins(["notes"]);

    assert!(matches!(
        ctx.exec("notes.ns", vec![]),
        Err(PluginError::NoDatabase)
    ));
}

// ==============================================================================
// Hooks
// ==============================================================================

#[test]
fn test_hook_dispatch() {
    let f = Fixture::new();
    f.install("events", subscriber("events", "events.saved"));
    f.install("audit", subscriber("audit", "events.saved"));
    let ctx = f.ctx(&["events", "audit"]);
    f.manager.load_plugin(&ctx, "audit").unwrap();

    ctx.exec("events.fire", vec![Value::from("a")]).unwrap();
    assert_eq!(ctx.item("events"), Some(Value::from("a")));
    assert_eq!(ctx.item("audit"), Some(Value::from("a")));
    assert!(f.manager.any_hook("events.saved"));
    assert_eq!(f.manager.hooks("events.saved").len(), 2);
}

#[test]
fn test_hook_skips_inactive_subscribers() {
    let f = Fixture::new();
    f.install("events", subscriber("events", "events.saved"));
    f.install("audit", subscriber("audit", "events.saved"));
    let ctx = f.ctx(&["events", "audit"]);
    f.manager.load_plugin(&ctx, "audit").unwrap();
    f.manager.load_plugin(&ctx, "events").unwrap();

    let mut narrow = ctx.clone();
    narrow.set_plugins(["events"]);
    narrow.exec("events.fire", vec![Value::from("b")]).unwrap();

    assert_eq!(ctx.item("events"), Some(Value::from("b")));
    assert_eq!(ctx.item("audit"), None);
}

#[test]
fn test_hook_namespace_is_enforced() {
    let f = Fixture::new();
    f.install("events", subscriber("events", "events.saved"));
    f.install(
        "rogue",
        caller("rogue", "", &[("fire", "plugins.execHook", &["events.saved"])]),
    );
    let ctx = f.ctx(&["events", "rogue"]);
    f.manager.load_plugin(&ctx, "events").unwrap();

    assert!(matches!(
        ctx.exec("rogue.fire", vec![]),
        Err(PluginError::InvalidHookName(_))
    ));
    assert_eq!(ctx.item("events"), None);

    // host code may fire any hook
    f.manager
        .exec_hook(&ctx, "events.saved", vec![Value::from("host")])
        .unwrap();
    assert_eq!(ctx.item("events"), Some(Value::from("host")));
}

#[test]
fn test_hook_stops_at_first_error() {
    use Instruction::*;
    let f = Fixture::new();
    let mut failing = Asm::new("failing");
    let hook = failing.str("events.saved");
    failing.func(
        "init",
        &[],
        false,
        vec![hook, LoadFunction { name: "boom".to_string() }, native("plugins.addHook", 2), Return],
    );
    let message = failing.str("boom");
    failing.func("boom", &["x"], false, vec![message, native("error", 1), Return]);
    f.install("failing", failing.build());
    f.install("audit", subscriber("audit", "events.saved"));

    let ctx = f.ctx(&["failing", "audit"]);
    f.manager.load_plugin(&ctx, "failing").unwrap();
    f.manager.load_plugin(&ctx, "audit").unwrap();

    let err = f
        .manager
        .exec_hook(&ctx, "events.saved", vec![Value::from("x")])
        .unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(ctx.item("audit"), None);
}

#[test]
fn test_reload_drops_stale_hooks() {
    let f = Fixture::new();
    f.install("events", subscriber("events", "events.saved"));
    f.install("audit", subscriber("audit", "events.saved"));
    let ctx = f.ctx(&["events", "audit"]);
    f.manager.load_plugin(&ctx, "audit").unwrap();
    f.manager.load_plugin(&ctx, "events").unwrap();
    assert_eq!(f.manager.hooks("events.saved").len(), 2);

    // audit v2 no longer subscribes
    f.install("audit", caller("audit", "", &[]));
    f.manager.reload_plugin(&ctx, "audit").unwrap();

    let hooks = f.manager.hooks("events.saved");
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].plugin, "events");

    ctx.exec("events.fire", vec![Value::from("c")]).unwrap();
    assert_eq!(ctx.item("audit"), None);

    f.manager.clear(Some("events")).unwrap();
    assert!(!f.manager.any_hook("events.saved"));
}

#[test]
fn test_add_hook_outside_plugin() {
    let f = Fixture::new();
    let ctx = f.ctx(&[]);
    assert!(matches!(
        f.manager.add_hook(&ctx, "x.y", 0),
        Err(PluginError::NotInPlugin)
    ));
}

// ==============================================================================
// Budgets
// ==============================================================================

fn budget_fixture(limits: Limits) -> Fixture {
    let f = Fixture::with_config(ManagerConfig::new().with_limits(limits));
    let mut inner = Asm::new("inner");
    let one = inner.str("done");
    inner.func("work", &[], true, vec![one, Instruction::Return]);
    f.install("inner", inner.build());
    f.install(
        "outer",
        caller("outer", "", &[("run", "runtime.exec", &["inner.work"])]),
    );
    f
}

#[test]
fn test_nested_calls_share_step_budget() {
    let limits = Limits {
        max_steps: 4,
        ..Limits::unlimited()
    };
    let f = budget_fixture(limits);
    let ctx = f.ctx(&["inner", "outer"]);
    f.manager.load_plugin(&ctx, "inner").unwrap();
    f.manager.load_plugin(&ctx, "outer").unwrap();

    // each top-level call gets a fresh budget
    for _ in 0..3 {
        assert_eq!(ctx.exec("inner.work", vec![]).unwrap(), Value::from("done"));
    }

    let err = ctx.exec("outer.run", vec![]).unwrap_err();
    assert!(matches!(
        err,
        PluginError::Runtime(RuntimeError::StepLimitExceeded { limit: 4 })
    ));
}

#[test]
fn test_budget_counts_every_hop() {
    let f = budget_fixture(Limits::unlimited());
    let ctx = f.ctx(&["inner", "outer"]);
    f.manager.load_plugin(&ctx, "inner").unwrap();
    f.manager.load_plugin(&ctx, "outer").unwrap();

    let mut direct = f.manager.budget();
    f.manager
        .exec_with_budget(&ctx, "inner.work", vec![], false, true, &mut direct)
        .unwrap();
    let mut nested = f.manager.budget();
    f.manager
        .exec_with_budget(&ctx, "outer.run", vec![], false, true, &mut nested)
        .unwrap();

    assert_eq!(direct.steps, 2);
    assert_eq!(nested.steps, 5);
    assert_eq!(nested.frames, 0);
}

#[test]
fn test_recursion_across_plugins_hits_frame_limit() {
    let limits = Limits {
        max_frames: 16,
        ..Limits::unlimited()
    };
    let f = Fixture::with_config(ManagerConfig::new().with_limits(limits));
    f.install(
        "deep",
        caller("deep", "", &[("recurse", "runtime.exec", &["deep.recurse"])]),
    );
    let ctx = f.ctx(&["deep"]);

    let err = ctx.exec("deep.recurse", vec![]).unwrap_err();
    assert!(matches!(
        err,
        PluginError::Runtime(RuntimeError::FrameLimitExceeded { limit: 16 })
    ));
}

#[test]
fn test_unlimited_frames_stop_at_call_depth_cap() {
    let f = Fixture::with_config(ManagerConfig::new().with_limits(Limits::unlimited()));
    f.install(
        "deep",
        caller("deep", "", &[("recurse", "runtime.exec", &["deep.recurse"])]),
    );
    let ctx = f.ctx(&["deep"]);

    let result = std::thread::Builder::new()
        .stack_size(CALL_STACK_SIZE)
        .spawn(move || ctx.exec("deep.recurse", vec![]))
        .unwrap()
        .join()
        .unwrap();
    assert!(matches!(
        result,
        Err(PluginError::Runtime(RuntimeError::FrameLimitExceeded {
            limit: MAX_CALL_DEPTH
        }))
    ));
}

// ==============================================================================
// Isolation
// ==============================================================================

#[test]
fn test_isolate_reinitializes_plugins() {
    let f = Fixture::new();
    f.install("counter", counter());
    f.install("events", subscriber("events", "events.saved"));
    let ctx = f.ctx(&["counter", "events"]);
    ctx.exec("counter.add", vec![Value::Int(1)]).unwrap();
    ctx.exec("counter.add", vec![Value::Int(2)]).unwrap();
    f.manager.load_plugin(&ctx, "events").unwrap();

    let isolated = f.manager.isolate(&ctx).unwrap();
    assert!(!isolated.ptr_eq(&f.manager));
    assert_eq!(isolated.all_plugins().len(), 2);
    assert_eq!(isolated.hooks("events.saved").len(), 1);

    let mut tenant = ctx.clone();
    tenant.manager = Some(isolated.clone());
    assert_eq!(tenant.exec("counter.add", vec![Value::Int(9)]).unwrap(), Value::Int(1));
    assert_eq!(ctx.exec("counter.add", vec![Value::Int(3)]).unwrap(), Value::Int(3));

    let original = f.manager.get_plugin("counter").unwrap().unwrap();
    let copy = isolated.get_plugin("counter").unwrap().unwrap();
    assert!(Arc::ptr_eq(original.program(), copy.program()));
    assert!(!original.globals().ptr_eq(copy.globals()));
}

#[test]
fn test_copy_shares_plugins() {
    let f = Fixture::new();
    f.install("counter", counter());
    let ctx = f.ctx(&["counter"]);
    ctx.exec("counter.add", vec![Value::Int(1)]).unwrap();

    let copy = f.manager.copy();
    let mut tenant = ctx.clone();
    tenant.manager = Some(copy.clone());
    assert_eq!(tenant.exec("counter.add", vec![Value::Int(2)]).unwrap(), Value::Int(2));
    assert_eq!(ctx.exec("counter.add", vec![Value::Int(3)]).unwrap(), Value::Int(3));

    copy.clear(None).unwrap();
    assert!(f.manager.get_plugin("counter").unwrap().is_some());
}
