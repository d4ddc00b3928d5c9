//! # gantry-runtime
//!
//! Bytecode engine that runs Gantry plugins.
//!
//! This crate provides:
//! - Bytecode loading and validation
//! - Immutable programs with function lookup and directives
//! - A stack VM with step, allocation and frame budgets
//! - Capability-based security model
//! - Filesystem abstraction and plugin discovery
//!
//! ## Plugin Structure
//!
//! A plugin named `name` is either:
//! - `name.gt` - compiled bytecode (`GTB\x01` header followed by the program)
//! - `plugins/name/main.json` - source form, compiled on load in debug mode
//!
//! ## Security Model
//!
//! Programs declare capabilities through directives. The VM exposes them via
//! [`Vm::has_permission`] and [`Vm::trusted`]; host natives decide what each
//! capability unlocks.

pub mod budget;
pub mod bytecode;
pub mod capability;
pub mod discovery;
pub mod error;
pub mod fs;
pub mod program;
pub mod value;
pub mod vm;

pub use budget::{Budget, CALL_STACK_SIZE, MAX_CALL_DEPTH};
pub use bytecode::{Bytecode, BytecodeLoader, Constant, Function, Instruction};
pub use capability::{Capability, CapabilitySet};
pub use discovery::{discover_plugins, is_identifier, plugin_name, plugin_path, DiscoveredPlugin};
pub use error::{RuntimeError, RuntimeResult};
pub use fs::{DirFileSystem, FileSystem, MemoryFileSystem};
pub use program::{FunctionInfo, Program};
pub use value::Value;
pub use vm::{Globals, NativeFn, Natives, Vm};
