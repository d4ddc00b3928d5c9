//! Stack virtual machine.
//!
//! A [`Vm`] runs one program against a [`Globals`] slice. The VM is
//! single-threaded per invocation; concurrency comes from running several
//! VMs, each built with [`Vm::clone_with`] around the same program.
//!
//! Host functionality is reached through [`Natives`], a name to function
//! table that receives the calling VM. `C` is the host context carried by
//! the VM and handed to natives through [`Vm::context`].

use crate::budget::Budget;
use crate::bytecode::{Constant, Instruction};
use crate::capability::Capability;
use crate::error::{RuntimeError, RuntimeResult};
use crate::program::Program;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Signature of a host function callable from scripts.
pub type NativeFn<C> = fn(&mut Vm<C>, Vec<Value>) -> RuntimeResult<Value>;

/// Module-level global values of one plugin instance.
///
/// Cloning shares the underlying storage. The lock is taken per access, never
/// across a call, so re-entrant calls into the same plugin cannot deadlock.
#[derive(Debug, Clone, Default)]
pub struct Globals(Arc<RwLock<Vec<Value>>>);

impl Globals {
    /// Create `count` null slots.
    pub fn new(count: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![Value::Null; count])))
    }

    pub fn get(&self, index: usize) -> RuntimeResult<Value> {
        let values = self.0.read().unwrap_or_else(PoisonError::into_inner);
        values
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::ExecutionError(format!("global {} out of range", index)))
    }

    pub fn set(&self, index: usize, value: Value) -> RuntimeResult<()> {
        let mut values = self.0.write().unwrap_or_else(PoisonError::into_inner);
        let slot = values
            .get_mut(index)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("global {} out of range", index)))?;
        *slot = value;
        Ok(())
    }

    /// Copy of every slot.
    pub fn snapshot(&self) -> Vec<Value> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles point at the same storage.
    pub fn ptr_eq(&self, other: &Globals) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Table of host functions.
pub struct Natives<C> {
    table: HashMap<String, NativeFn<C>>,
}

impl<C> Natives<C> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// A table holding the builtins `len`, `push`, `str` and `error`.
    pub fn with_builtins() -> Self {
        let mut natives = Self::new();
        natives.register("len", builtin_len::<C>);
        natives.register("push", builtin_push::<C>);
        natives.register("str", builtin_str::<C>);
        natives.register("error", builtin_error::<C>);
        natives
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, f: NativeFn<C>) {
        self.table.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn<C>> {
        self.table.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

impl<C> Default for Natives<C> {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl<C> Clone for Natives<C> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Natives<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Natives").field("names", &names).finish()
    }
}

/// Check the number of arguments passed to a native.
pub fn check_args(name: &str, args: &[Value], expected: usize) -> RuntimeResult<()> {
    if args.len() != expected {
        return Err(RuntimeError::ExecutionError(format!(
            "{} expects {} arguments, got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

/// Extract a string argument.
pub fn string_arg<'a>(name: &str, args: &'a [Value], index: usize) -> RuntimeResult<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        RuntimeError::ExecutionError(format!("{}: argument {} must be a string", name, index + 1))
    })
}

fn builtin_len<C>(_vm: &mut Vm<C>, args: Vec<Value>) -> RuntimeResult<Value> {
    check_args("len", &args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::Array(a) => Ok(Value::Int(a.len() as i64)),
        other => Err(RuntimeError::ExecutionError(format!(
            "len: unsupported type {}",
            other.type_name()
        ))),
    }
}

fn builtin_push<C>(vm: &mut Vm<C>, mut args: Vec<Value>) -> RuntimeResult<Value> {
    check_args("push", &args, 2)?;
    let item = args.pop().unwrap_or_default();
    match args.pop().unwrap_or_default() {
        Value::Array(mut items) => {
            vm.budget.allocate()?;
            items.push(item);
            Ok(Value::Array(items))
        }
        other => Err(RuntimeError::ExecutionError(format!(
            "push: expected array, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_str<C>(vm: &mut Vm<C>, args: Vec<Value>) -> RuntimeResult<Value> {
    check_args("str", &args, 1)?;
    vm.budget.allocate()?;
    Ok(Value::String(args[0].to_string()))
}

fn builtin_error<C>(_vm: &mut Vm<C>, args: Vec<Value>) -> RuntimeResult<Value> {
    let message = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    Err(RuntimeError::ExecutionError(message))
}

/// A virtual machine bound to one program and one globals slice.
pub struct Vm<C> {
    program: Arc<Program>,
    globals: Globals,
    natives: Arc<Natives<C>>,
    /// Host context visible to natives.
    pub context: C,
    /// Resource accounting for this VM.
    pub budget: Budget,
    /// Whether the running program declared the `trusted` capability.
    pub trusted: bool,
}

impl<C> Vm<C> {
    /// Create a VM with fresh globals and an unlimited budget.
    pub fn new(program: Arc<Program>, natives: Arc<Natives<C>>, context: C) -> Self {
        let globals = Globals::new(program.global_count());
        let trusted = program.is_trusted();
        Self {
            program,
            globals,
            natives,
            context,
            budget: Budget::unlimited(),
            trusted,
        }
    }

    /// Replace the budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Run against an existing globals slice instead of fresh storage.
    pub fn with_globals(mut self, globals: Globals) -> Self {
        self.globals = globals;
        self
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn natives(&self) -> &Arc<Natives<C>> {
        &self.natives
    }

    /// Check a capability declared by the running program.
    pub fn has_permission(&self, cap: &Capability) -> bool {
        self.program.capabilities().has(cap)
    }

    /// Run the module-init function once against fresh globals and return them.
    pub fn initialize(&mut self) -> RuntimeResult<Globals> {
        self.globals = Globals::new(self.program.global_count());
        let entry = self.program.entry_point();
        self.run_function(entry, Vec::new())?;
        Ok(self.globals.clone())
    }

    /// A VM for `program` sharing `globals`, natives and context.
    ///
    /// The budget keeps the ceilings but starts with nothing consumed; callers
    /// that chain budgets replace it with a fork of their own.
    pub fn clone_with(&self, program: Arc<Program>, globals: Globals) -> Vm<C>
    where
        C: Clone,
    {
        let trusted = program.is_trusted();
        Vm {
            program,
            globals,
            natives: Arc::clone(&self.natives),
            context: self.context.clone(),
            budget: self.budget.limits(),
            trusted,
        }
    }

    pub fn run_function_by_name(&mut self, name: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let index = self
            .program
            .function_index(name)
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_string()))?;
        self.run_function(index, args)
    }

    /// Run the function at `index` of the program.
    pub fn run_function(&mut self, index: usize, args: Vec<Value>) -> RuntimeResult<Value> {
        self.budget.enter_frame()?;
        let result = self.execute(index, args);
        self.budget.exit_frame();
        result
    }

    fn execute(&mut self, index: usize, args: Vec<Value>) -> RuntimeResult<Value> {
        let program = Arc::clone(&self.program);
        let function = program
            .function(index)
            .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", index)))?;

        if args.len() != function.params.len() {
            return Err(RuntimeError::ExecutionError(format!(
                "{} expects {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }

        let mut locals = args;
        locals.resize(function.local_count, Value::Null);
        let mut stack: Vec<Value> = Vec::new();
        let code = &function.instructions;
        let mut pc = 0;

        while pc < code.len() {
            self.budget.step()?;
            let mut next = pc + 1;

            match &code[pc] {
                Instruction::LoadConst { index } => {
                    stack.push(constant_value(&program.constants()[*index]));
                }
                Instruction::LoadLocal { index } => stack.push(locals[*index].clone()),
                Instruction::StoreLocal { index } => locals[*index] = pop(&mut stack)?,
                Instruction::LoadGlobal { index } => stack.push(self.globals.get(*index)?),
                Instruction::StoreGlobal { index } => {
                    let value = pop(&mut stack)?;
                    self.globals.set(*index, value)?;
                }
                Instruction::LoadFunction { name } => {
                    let target = program
                        .function_index(name)
                        .ok_or_else(|| RuntimeError::UnknownFunction(name.clone()))?;
                    stack.push(Value::Func(target));
                }
                Instruction::Call { name, arg_count } => {
                    let call_args = pop_n(&mut stack, *arg_count)?;
                    let target = program
                        .function_index(name)
                        .ok_or_else(|| RuntimeError::UnknownFunction(name.clone()))?;
                    let value = self.run_function(target, call_args)?;
                    stack.push(value);
                }
                Instruction::CallNative { name, arg_count } => {
                    let call_args = pop_n(&mut stack, *arg_count)?;
                    let native = self
                        .natives
                        .get(name)
                        .ok_or_else(|| RuntimeError::UnknownNative(name.clone()))?;
                    let value = native(self, call_args)?;
                    stack.push(value);
                }
                Instruction::Return => return Ok(stack.pop().unwrap_or_default()),
                Instruction::Jump { offset } => next = jump_target(pc, *offset),
                Instruction::JumpIfFalse { offset } => {
                    if !pop(&mut stack)?.is_truthy() {
                        next = jump_target(pc, *offset);
                    }
                }
                Instruction::Pop => {
                    pop(&mut stack)?;
                }
                Instruction::Dup => {
                    let top = stack.last().cloned().ok_or_else(stack_underflow)?;
                    stack.push(top);
                }
                Instruction::Add => {
                    let (a, b) = pop_pair(&mut stack)?;
                    let value = self.add(a, b)?;
                    stack.push(value);
                }
                Instruction::Sub => binary_numeric(&mut stack, "-", i64::checked_sub, |a, b| a - b)?,
                Instruction::Mul => binary_numeric(&mut stack, "*", i64::checked_mul, |a, b| a * b)?,
                Instruction::Div => {
                    if matches!(stack.last(), Some(Value::Int(0))) {
                        return Err(RuntimeError::ExecutionError("division by zero".to_string()));
                    }
                    binary_numeric(&mut stack, "/", i64::checked_div, |a, b| a / b)?
                }
                Instruction::Eq => {
                    let (a, b) = pop_pair(&mut stack)?;
                    stack.push(Value::Bool(values_equal(&a, &b)));
                }
                Instruction::Ne => {
                    let (a, b) = pop_pair(&mut stack)?;
                    stack.push(Value::Bool(!values_equal(&a, &b)));
                }
                Instruction::Lt => compare(&mut stack, Ordering::is_lt)?,
                Instruction::Le => compare(&mut stack, Ordering::is_le)?,
                Instruction::Gt => compare(&mut stack, Ordering::is_gt)?,
                Instruction::Ge => compare(&mut stack, Ordering::is_ge)?,
                Instruction::Not => {
                    let v = pop(&mut stack)?;
                    stack.push(Value::Bool(!v.is_truthy()));
                }
                Instruction::And => {
                    let (a, b) = pop_pair(&mut stack)?;
                    stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Instruction::Or => {
                    let (a, b) = pop_pair(&mut stack)?;
                    stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Instruction::MakeArray { count } => {
                    let items = pop_n(&mut stack, *count)?;
                    self.budget.allocate()?;
                    stack.push(Value::Array(items));
                }
                Instruction::GetIndex => {
                    let (target, index) = pop_pair(&mut stack)?;
                    stack.push(get_index(&target, &index)?);
                }
                Instruction::SetIndex => {
                    let value = pop(&mut stack)?;
                    let (target, index) = pop_pair(&mut stack)?;
                    stack.push(set_index(target, &index, value)?);
                }
                Instruction::Nop => {}
            }

            pc = next;
        }

        Ok(Value::Null)
    }

    fn add(&mut self, a: Value, b: Value) -> RuntimeResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => x
                .checked_add(y)
                .map(Value::Int)
                .ok_or_else(|| RuntimeError::ExecutionError("integer overflow".to_string())),
            (Value::Array(mut x), Value::Array(y)) => {
                self.budget.allocate()?;
                x.extend(y);
                Ok(Value::Array(x))
            }
            (Value::String(x), y) => {
                self.budget.allocate()?;
                Ok(Value::String(format!("{}{}", x, y)))
            }
            (x, Value::String(y)) => {
                self.budget.allocate()?;
                Ok(Value::String(format!("{}{}", x, y)))
            }
            (x, y) => match (as_float(&x), as_float(&y)) {
                (Some(x), Some(y)) => Ok(Value::Float(x + y)),
                _ => Err(type_error("+", &x, &y)),
            },
        }
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(s) => Value::String(s.clone()),
    }
}

// validate() keeps targets within 0..=len
fn jump_target(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64).max(0) as usize
}

fn stack_underflow() -> RuntimeError {
    RuntimeError::ExecutionError("stack underflow".to_string())
}

fn pop(stack: &mut Vec<Value>) -> RuntimeResult<Value> {
    stack.pop().ok_or_else(stack_underflow)
}

fn pop_pair(stack: &mut Vec<Value>) -> RuntimeResult<(Value, Value)> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    Ok((a, b))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> RuntimeResult<Vec<Value>> {
    if stack.len() < n {
        return Err(stack_underflow());
    }
    Ok(stack.split_off(stack.len() - n))
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn type_error(op: &str, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::ExecutionError(format!(
        "unsupported operand types for {}: {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn binary_numeric(
    stack: &mut Vec<Value>,
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> RuntimeResult<()> {
    let (a, b) = pop_pair(stack)?;
    let value = match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| RuntimeError::ExecutionError("integer overflow".to_string()))?,
        _ => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => Value::Float(float_op(x, y)),
            _ => return Err(type_error(op, &a, &b)),
        },
    };
    stack.push(value);
    Ok(())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            as_float(a) == as_float(b)
        }
        _ => a == b,
    }
}

fn compare(stack: &mut Vec<Value>, test: fn(Ordering) -> bool) -> RuntimeResult<()> {
    let (a, b) = pop_pair(stack)?;
    let ordering = match (&a, &b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => return Err(type_error("comparison", &a, &b)),
        },
    };
    stack.push(Value::Bool(ordering.is_some_and(test)));
    Ok(())
}

fn get_index(target: &Value, index: &Value) -> RuntimeResult<Value> {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or_default()),
        (Value::String(s), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or_default()),
        _ => Err(type_error("index", target, index)),
    }
}

fn set_index(target: Value, index: &Value, value: Value) -> RuntimeResult<Value> {
    match (target, index) {
        (Value::Array(mut items), Value::Int(i)) => {
            let slot = usize::try_from(*i)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    RuntimeError::ExecutionError(format!("index {} out of range", i))
                })?;
            *slot = value;
            Ok(Value::Array(items))
        }
        (target, index) => Err(type_error("index assignment", &target, index)),
    }
}
