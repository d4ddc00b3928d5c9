//! Gantry bytecode format and loader.
//!
//! Programs exist in two forms:
//!
//! ```text
//! source  (main.json)   JSON intermediate representation
//! binary  (<name>.gt)   +----------------+
//!                       | Magic (4 bytes)|  "GTB\x01" (version 1)
//!                       +----------------+
//!                       | JSON payload   |
//!                       +----------------+
//! ```
//!
//! Both decode to the same [`Bytecode`] value, which must pass
//! [`BytecodeLoader::validate`] before the VM will run it.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Magic bytes for Gantry binary programs.
pub const MAGIC: &[u8; 4] = b"GTB\x01";

/// Current bytecode format version.
pub const VERSION: u8 = 1;

/// Gantry bytecode representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bytecode {
    /// Version of the bytecode format.
    pub version: u8,

    /// Metadata embedded in bytecode.
    #[serde(default)]
    pub metadata: BytecodeMetadata,

    /// Constant pool.
    #[serde(default)]
    pub constants: Vec<Constant>,

    /// Function definitions.
    pub functions: Vec<Function>,

    /// Number of module-level global slots.
    #[serde(default)]
    pub global_count: usize,

    /// Module-init function name.
    pub entry_point: String,

    /// Compile-time directives, e.g. `permissions = "trusted"`.
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
}

/// Metadata embedded in bytecode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BytecodeMetadata {
    /// Plugin ID.
    #[serde(default)]
    pub plugin_id: String,

    /// Plugin version.
    #[serde(default)]
    pub plugin_version: String,

    /// Compilation timestamp.
    pub compiled_at: Option<String>,

    /// Compiler version.
    pub compiler_version: Option<String>,
}

/// A constant value in the constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// String value.
    String(String),
}

/// A function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,

    /// Parameter names. Parameters occupy the first local slots.
    #[serde(default)]
    pub params: Vec<String>,

    /// Whether code outside the program may call this function.
    #[serde(default)]
    pub exported: bool,

    /// Local variable count, parameters included.
    #[serde(default)]
    pub local_count: usize,

    /// Instructions.
    pub instructions: Vec<Instruction>,
}

/// A bytecode instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    /// Load a constant from the pool.
    LoadConst { index: usize },

    /// Load a local variable.
    LoadLocal { index: usize },

    /// Store to a local variable.
    StoreLocal { index: usize },

    /// Load a module-level global.
    LoadGlobal { index: usize },

    /// Store to a module-level global.
    StoreGlobal { index: usize },

    /// Push a reference to a function of this program.
    LoadFunction { name: String },

    /// Call a function of this program.
    Call { name: String, arg_count: usize },

    /// Call a host function.
    CallNative { name: String, arg_count: usize },

    /// Return from function.
    Return,

    /// Jump relative to this instruction.
    Jump { offset: i32 },

    /// Jump relative to this instruction if top of stack is falsy.
    JumpIfFalse { offset: i32 },

    /// Pop value from stack.
    Pop,

    /// Duplicate top of stack.
    Dup,

    /// Binary add. Also concatenates strings and arrays.
    Add,

    /// Binary subtract.
    Sub,

    /// Binary multiply.
    Mul,

    /// Binary divide.
    Div,

    /// Comparison: equal.
    Eq,

    /// Comparison: not equal.
    Ne,

    /// Comparison: less than.
    Lt,

    /// Comparison: less than or equal.
    Le,

    /// Comparison: greater than.
    Gt,

    /// Comparison: greater than or equal.
    Ge,

    /// Logical not.
    Not,

    /// Logical and.
    And,

    /// Logical or.
    Or,

    /// Create array from N items on stack.
    MakeArray { count: usize },

    /// Get index from array.
    GetIndex,

    /// Set index in array. Pushes the updated array.
    SetIndex,

    /// No operation.
    Nop,
}

/// Bytecode loader.
pub struct BytecodeLoader;

impl BytecodeLoader {
    /// Parse bytecode from bytes in either form.
    pub fn parse(bytes: &[u8]) -> RuntimeResult<Bytecode> {
        if bytes.starts_with(MAGIC) {
            Self::parse_binary(bytes)
        } else {
            Self::parse_json(bytes)
        }
    }

    /// Parse the binary form. The magic header is required.
    pub fn parse_binary(bytes: &[u8]) -> RuntimeResult<Bytecode> {
        if bytes.len() < MAGIC.len() {
            return Err(RuntimeError::BytecodeError(
                "File too small to be valid bytecode".to_string(),
            ));
        }

        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(RuntimeError::BytecodeError(
                "Missing bytecode magic header".to_string(),
            ));
        }

        Self::parse_json(&bytes[MAGIC.len()..])
    }

    /// Parse the JSON source form.
    pub fn parse_json(bytes: &[u8]) -> RuntimeResult<Bytecode> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| RuntimeError::BytecodeError(format!("Invalid UTF-8: {}", e)))?;

        serde_json::from_str(content)
            .map_err(|e| RuntimeError::BytecodeError(format!("Invalid bytecode JSON: {}", e)))
    }

    /// Serialize to the binary form.
    pub fn to_binary(bytecode: &Bytecode) -> RuntimeResult<Vec<u8>> {
        let mut out = MAGIC.to_vec();
        serde_json::to_writer(&mut out, bytecode)?;
        Ok(out)
    }

    /// Validate bytecode structure.
    pub fn validate(bytecode: &Bytecode) -> RuntimeResult<()> {
        if bytecode.version != VERSION {
            return Err(RuntimeError::BytecodeError(format!(
                "Unsupported bytecode version: {}",
                bytecode.version
            )));
        }

        let mut names = HashSet::new();
        for function in &bytecode.functions {
            if !names.insert(function.name.as_str()) {
                return Err(RuntimeError::InvalidProgram(format!(
                    "Duplicate function '{}'",
                    function.name
                )));
            }
        }

        if !names.contains(bytecode.entry_point.as_str()) {
            return Err(RuntimeError::BytecodeError(format!(
                "Entry point function '{}' not found",
                bytecode.entry_point
            )));
        }

        for function in &bytecode.functions {
            Self::validate_function(bytecode, function, &names)?;
        }

        Ok(())
    }

    fn validate_function(
        bytecode: &Bytecode,
        function: &Function,
        names: &HashSet<&str>,
    ) -> RuntimeResult<()> {
        let invalid = |pc: usize, msg: String| {
            RuntimeError::InvalidProgram(format!("{} at {}:{}", msg, function.name, pc))
        };

        if function.params.len() > function.local_count {
            return Err(invalid(
                0,
                format!(
                    "{} params do not fit in {} locals",
                    function.params.len(),
                    function.local_count
                ),
            ));
        }

        let len = function.instructions.len() as i64;

        for (pc, instruction) in function.instructions.iter().enumerate() {
            match instruction {
                Instruction::LoadConst { index } if *index >= bytecode.constants.len() => {
                    return Err(invalid(pc, format!("constant {} out of range", index)));
                }
                Instruction::LoadLocal { index } | Instruction::StoreLocal { index }
                    if *index >= function.local_count =>
                {
                    return Err(invalid(pc, format!("local {} out of range", index)));
                }
                Instruction::LoadGlobal { index } | Instruction::StoreGlobal { index }
                    if *index >= bytecode.global_count =>
                {
                    return Err(invalid(pc, format!("global {} out of range", index)));
                }
                Instruction::LoadFunction { name } | Instruction::Call { name, .. }
                    if !names.contains(name.as_str()) =>
                {
                    return Err(invalid(pc, format!("unknown function '{}'", name)));
                }
                Instruction::Jump { offset } | Instruction::JumpIfFalse { offset } => {
                    let target = pc as i64 + *offset as i64;
                    if target < 0 || target > len {
                        return Err(invalid(pc, format!("jump target {} out of range", target)));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}
