//! Validated, immutable programs.

use crate::bytecode::{Bytecode, BytecodeLoader, Constant, Function};
use crate::capability::CapabilitySet;
use crate::error::RuntimeResult;
use std::collections::{BTreeMap, HashMap};

/// Lookup result for a function of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Position in the function table.
    pub index: usize,
    pub name: String,
    /// Number of declared parameters.
    pub arity: usize,
    pub exported: bool,
}

/// A compiled program. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Program {
    bytecode: Bytecode,
    by_name: HashMap<String, usize>,
    entry_point: usize,
    capabilities: CapabilitySet,
}

impl Program {
    /// Validate bytecode and index it.
    pub fn new(bytecode: Bytecode) -> RuntimeResult<Self> {
        BytecodeLoader::validate(&bytecode)?;

        let by_name: HashMap<String, usize> = bytecode
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        // validate() guarantees the entry point exists
        let entry_point = by_name.get(&bytecode.entry_point).copied().unwrap_or(0);
        let capabilities = CapabilitySet::from_directives(&bytecode.directives);

        Ok(Self {
            bytecode,
            by_name,
            entry_point,
            capabilities,
        })
    }

    /// Build a program from its JSON source form.
    pub fn compile(source: &[u8]) -> RuntimeResult<Self> {
        Self::new(BytecodeLoader::parse_json(source)?)
    }

    /// Build a program from its binary form.
    pub fn deserialize(bytes: &[u8]) -> RuntimeResult<Self> {
        Self::new(BytecodeLoader::parse_binary(bytes)?)
    }

    /// Serialize to the binary form.
    pub fn to_binary(&self) -> RuntimeResult<Vec<u8>> {
        BytecodeLoader::to_binary(&self.bytecode)
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionInfo> {
        let index = *self.by_name.get(name)?;
        let f = &self.bytecode.functions[index];
        Some(FunctionInfo {
            index,
            name: f.name.clone(),
            arity: f.params.len(),
            exported: f.exported,
        })
    }

    pub fn function(&self, index: usize) -> Option<&Function> {
        self.bytecode.functions.get(index)
    }

    pub(crate) fn function_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn functions(&self) -> &[Function] {
        &self.bytecode.functions
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn constants(&self) -> &[Constant] {
        &self.bytecode.constants
    }

    pub fn global_count(&self) -> usize {
        self.bytecode.global_count
    }

    pub fn directives(&self) -> &BTreeMap<String, String> {
        &self.bytecode.directives
    }

    /// A directive value with surrounding quotes removed.
    pub fn directive(&self, name: &str) -> Option<&str> {
        let v = self.bytecode.directives.get(name)?;
        let v = v.strip_prefix('"').unwrap_or(v);
        Some(v.strip_suffix('"').unwrap_or(v))
    }

    /// A directive value split on whitespace.
    pub fn directive_values(&self, name: &str) -> Option<Vec<&str>> {
        self.bytecode
            .directives
            .get(name)
            .map(|v| v.split_whitespace().collect())
    }

    /// Capabilities declared by the program's directives.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn is_trusted(&self) -> bool {
        self.capabilities.is_trusted()
    }
}
