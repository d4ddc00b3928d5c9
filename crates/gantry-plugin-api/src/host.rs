//! Host functions exposed to plugins.
//!
//! Bindings are grouped by prefix: `runtime.*`, `plugins.*`, `context.*` and
//! `db.*`. Calls that reach beyond the running plugin are checked against the
//! program's capabilities before they run.

use crate::context::Context;
use crate::db::Database;
use crate::error::{PluginError, PluginResult};
use gantry_runtime::vm::{check_args, string_arg};
use gantry_runtime::{Natives, RuntimeError, RuntimeResult, Value, Vm};
use std::sync::Arc;
use tracing::warn;

type HostVm = Vm<Context>;
type HostResult = RuntimeResult<Value>;

/// Builtins plus every host binding.
pub fn natives() -> Natives<Context> {
    let mut natives = Natives::with_builtins();
    register(&mut natives);
    natives
}

/// Register the host bindings into an existing table.
pub fn register(natives: &mut Natives<Context>) {
    natives.register("runtime.exec", runtime_exec);
    natives.register("runtime.execIfExists", runtime_exec_if_exists);
    natives.register("runtime.runFunc", runtime_run_func);
    natives.register("runtime.getItem", runtime_get_item);
    natives.register("runtime.setItem", runtime_set_item);

    natives.register("plugins.load", plugins_load);
    natives.register("plugins.reload", plugins_reload);
    natives.register("plugins.clear", plugins_clear);
    natives.register("plugins.get", plugins_get);
    natives.register("plugins.all", plugins_all);
    natives.register("plugins.addHook", plugins_add_hook);
    natives.register("plugins.execHook", plugins_exec_hook);
    natives.register("plugins.anyHook", plugins_any_hook);

    natives.register("context.tenant", context_tenant);
    natives.register("context.pluginName", context_plugin_name);
    natives.register("context.callerName", context_caller_name);
    natives.register("context.now", context_now);
    natives.register("context.addPlugin", context_add_plugin);
    natives.register("context.hasPlugin", context_has_plugin);
    natives.register("context.getPlugins", context_get_plugins);
    natives.register("context.setPlugins", context_set_plugins);
    natives.register("context.getItem", context_get_item);
    natives.register("context.setItem", context_set_item);

    natives.register("db.namespace", db_namespace);
    natives.register("db.put", db_put);
    natives.register("db.get", db_get);
    natives.register("db.delete", db_delete);
    natives.register("db.putIn", db_put_in);
    natives.register("db.getFrom", db_get_from);
}

fn require_trusted(vm: &HostVm, operation: &str) -> PluginResult<()> {
    if vm.trusted {
        return Ok(());
    }
    warn!(
        plugin = vm.context.plugin_name().unwrap_or("<host>"),
        operation,
        "Unauthorized host call"
    );
    Err(PluginError::Unauthorized(operation.to_string()))
}

/// Trusted programs may touch any plugin; others only the tenant's.
fn require_trusted_or_active(vm: &HostVm, plugin: &str, operation: &str) -> PluginResult<()> {
    if vm.trusted || vm.context.has_plugin(plugin) {
        return Ok(());
    }
    warn!(
        plugin = vm.context.plugin_name().unwrap_or("<host>"),
        target = plugin,
        operation,
        "Unauthorized host call"
    );
    Err(PluginError::Unauthorized(format!("{} {}", operation, plugin)))
}

/// First argument as a name, the rest passed through.
fn split_name(operation: &str, args: Vec<Value>) -> RuntimeResult<(String, Vec<Value>)> {
    let mut args = args.into_iter();
    match args.next() {
        Some(Value::String(name)) => Ok((name, args.collect())),
        Some(other) => Err(RuntimeError::ExecutionError(format!(
            "{}: argument 1 must be a string, got {}",
            operation,
            other.type_name()
        ))),
        None => Err(RuntimeError::ExecutionError(format!(
            "{} expects at least 1 argument",
            operation
        ))),
    }
}

fn database(vm: &HostVm) -> PluginResult<Database> {
    vm.context.db.clone().ok_or(PluginError::NoDatabase)
}

fn names_array(vm: &mut HostVm, names: Vec<String>) -> HostResult {
    vm.budget.allocate()?;
    Ok(Value::Array(names.into_iter().map(Value::String).collect()))
}

// ----------------------------------------------------------------------
// runtime.*
// ----------------------------------------------------------------------

fn exec_binding(vm: &mut HostVm, args: Vec<Value>, only_if_exists: bool, op: &str) -> HostResult {
    let (name, rest) = split_name(op, args)?;
    let ctx = vm.context.clone();
    let manager = ctx.manager()?;
    // trusted callers may reach unexported functions
    let only_exported = !vm.trusted;
    let value = manager.exec_with_budget(
        &ctx,
        &name,
        rest,
        only_if_exists,
        only_exported,
        &mut vm.budget,
    )?;
    Ok(value.unwrap_or_default())
}

fn runtime_exec(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    exec_binding(vm, args, false, "runtime.exec")
}

fn runtime_exec_if_exists(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    exec_binding(vm, args, true, "runtime.execIfExists")
}

/// Run a loaded plugin's function with this VM's context, unchanged.
fn runtime_run_func(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "runtime.runFunc")?;
    let (name, rest) = split_name("runtime.runFunc", args)?;
    let (plugin_name, function) = crate::manager::parse_function_name(&name)?;

    let manager = vm.context.manager()?;
    let plugin = manager
        .get_plugin(plugin_name)?
        .ok_or_else(|| PluginError::PluginNotLoaded(plugin_name.to_string()))?;
    let info = plugin
        .function(function)
        .ok_or_else(|| PluginError::FunctionNotFound(name.clone()))?;

    let mut child = vm
        .clone_with(Arc::clone(plugin.program()), plugin.globals().clone())
        .with_budget(vm.budget.fork());
    let result = child.run_function(info.index, rest);
    vm.budget.absorb(&child.budget);
    result
}

fn runtime_get_item(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "runtime.getItem")?;
    check_args("runtime.getItem", &args, 1)?;
    let key = string_arg("runtime.getItem", &args, 0)?;
    Ok(vm.context.protected_item(key))
}

fn runtime_set_item(vm: &mut HostVm, mut args: Vec<Value>) -> HostResult {
    require_trusted(vm, "runtime.setItem")?;
    check_args("runtime.setItem", &args, 2)?;
    let value = args.pop().unwrap_or_default();
    let key = string_arg("runtime.setItem", &args, 0)?;
    vm.context.set_protected_item(key, value);
    Ok(Value::Null)
}

// ----------------------------------------------------------------------
// plugins.*
// ----------------------------------------------------------------------

fn plugins_load(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("plugins.load", &args, 1)?;
    let name = string_arg("plugins.load", &args, 0)?;
    require_trusted_or_active(vm, name, "plugins.load")?;
    let ctx = vm.context.clone();
    let plugin = ctx
        .manager()?
        .load_plugin_with_budget(&ctx, name, &mut vm.budget)?;
    Ok(Value::String(plugin.name().to_string()))
}

fn plugins_reload(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("plugins.reload", &args, 1)?;
    let name = string_arg("plugins.reload", &args, 0)?;
    require_trusted_or_active(vm, name, "plugins.reload")?;
    let ctx = vm.context.clone();
    let plugin = ctx
        .manager()?
        .reload_plugin_with_budget(&ctx, name, &mut vm.budget)?;
    Ok(Value::String(plugin.name().to_string()))
}

fn plugins_clear(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "plugins.clear")?;
    let manager = vm.context.manager()?;
    match args.as_slice() {
        [] | [Value::Null] => manager.clear(None)?,
        [Value::String(name)] => manager.clear(Some(name))?,
        _ => {
            return Err(RuntimeError::ExecutionError(
                "plugins.clear expects an optional plugin name".to_string(),
            ))
        }
    }
    Ok(Value::Null)
}

fn plugins_get(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "plugins.get")?;
    check_args("plugins.get", &args, 1)?;
    let name = string_arg("plugins.get", &args, 0)?;
    let plugin = vm.context.manager()?.get_plugin(name)?;
    Ok(plugin
        .map(|p| Value::String(p.name().to_string()))
        .unwrap_or_default())
}

fn plugins_all(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "plugins.all")?;
    check_args("plugins.all", &args, 0)?;
    let names = vm
        .context
        .manager()?
        .all_plugins()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    names_array(vm, names)
}

fn plugins_add_hook(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("plugins.addHook", &args, 2)?;
    let name = string_arg("plugins.addHook", &args, 0)?;
    let function = match &args[1] {
        Value::Func(index) => *index,
        other => {
            return Err(RuntimeError::ExecutionError(format!(
                "plugins.addHook: argument 2 must be a function, got {}",
                other.type_name()
            )))
        }
    };
    vm.context
        .manager()?
        .add_hook(&vm.context, name, function)?;
    Ok(Value::Null)
}

fn plugins_exec_hook(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    let (name, rest) = split_name("plugins.execHook", args)?;
    let ctx = vm.context.clone();
    ctx.manager()?
        .exec_hook_with_budget(&ctx, &name, rest, &mut vm.budget)?;
    Ok(Value::Null)
}

fn plugins_any_hook(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("plugins.anyHook", &args, 1)?;
    let name = string_arg("plugins.anyHook", &args, 0)?;
    Ok(Value::Bool(vm.context.manager()?.any_hook(name)))
}

// ----------------------------------------------------------------------
// context.*
// ----------------------------------------------------------------------

fn context_tenant(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.tenant", &args, 0)?;
    Ok(Value::String(vm.context.tenant.clone()))
}

fn context_plugin_name(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.pluginName", &args, 0)?;
    Ok(vm.context.plugin_name().map(Value::from).unwrap_or_default())
}

fn context_caller_name(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.callerName", &args, 0)?;
    Ok(vm.context.caller_name().map(Value::from).unwrap_or_default())
}

fn context_now(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.now", &args, 0)?;
    Ok(Value::String(vm.context.now().to_rfc3339()))
}

fn context_add_plugin(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.addPlugin", &args, 1)?;
    let name = string_arg("context.addPlugin", &args, 0)?;
    vm.context.add_plugin(name);
    Ok(Value::Null)
}

fn context_has_plugin(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.hasPlugin", &args, 1)?;
    let name = string_arg("context.hasPlugin", &args, 0)?;
    Ok(Value::Bool(vm.context.has_plugin(name)))
}

fn context_get_plugins(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.getPlugins", &args, 0)?;
    let names = vm.context.get_plugins().to_vec();
    names_array(vm, names)
}

fn context_set_plugins(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    require_trusted(vm, "context.setPlugins")?;
    check_args("context.setPlugins", &args, 1)?;
    let names: Vec<String> = match &args[0] {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    RuntimeError::ExecutionError(format!(
                        "context.setPlugins: expected string, got {}",
                        item.type_name()
                    ))
                })
            })
            .collect::<RuntimeResult<_>>()?,
        other => {
            return Err(RuntimeError::ExecutionError(format!(
                "context.setPlugins: expected array, got {}",
                other.type_name()
            )))
        }
    };
    vm.context.set_plugins(names);
    Ok(Value::Null)
}

fn context_get_item(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("context.getItem", &args, 1)?;
    let key = string_arg("context.getItem", &args, 0)?;
    Ok(vm.context.item(key).unwrap_or_default())
}

fn context_set_item(vm: &mut HostVm, mut args: Vec<Value>) -> HostResult {
    check_args("context.setItem", &args, 2)?;
    let value = args.pop().unwrap_or_default();
    let key = string_arg("context.setItem", &args, 0)?;
    vm.context.set_item(key, value);
    Ok(Value::Null)
}

// ----------------------------------------------------------------------
// db.*
// ----------------------------------------------------------------------

fn db_namespace(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.namespace", &args, 0)?;
    Ok(Value::String(database(vm)?.namespace()))
}

fn db_put(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.put", &args, 2)?;
    let key = string_arg("db.put", &args, 0)?;
    database(vm)?.put(key, &args[1])?;
    Ok(Value::Null)
}

fn db_get(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.get", &args, 1)?;
    let key = string_arg("db.get", &args, 0)?;
    Ok(database(vm)?.get(key)?.unwrap_or_default())
}

fn db_delete(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.delete", &args, 1)?;
    let key = string_arg("db.delete", &args, 0)?;
    Ok(Value::Bool(database(vm)?.delete(key)?))
}

fn db_put_in(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.putIn", &args, 3)?;
    let namespace = string_arg("db.putIn", &args, 0)?;
    let key = string_arg("db.putIn", &args, 1)?;
    database(vm)?.put_in(namespace, key, &args[2])?;
    Ok(Value::Null)
}

fn db_get_from(vm: &mut HostVm, args: Vec<Value>) -> HostResult {
    check_args("db.getFrom", &args, 2)?;
    let namespace = string_arg("db.getFrom", &args, 0)?;
    let key = string_arg("db.getFrom", &args, 1)?;
    Ok(database(vm)?.get_from(namespace, key)?.unwrap_or_default())
}
