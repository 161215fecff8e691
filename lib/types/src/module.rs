//! What the code layer needs to know about a validated module.
use crate::entity::{EntityRef, PrimaryMap};
use crate::indexes::FunctionIndex;
use crate::tier::CompileMode;
use crate::types::FunctionType;
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Module facts produced by the validator and shared by every tier of the
/// module's code.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ModuleMetadata {
    /// The name of this wasm module, often found in the wasm file.
    pub name: Option<String>,

    /// Number of imported functions. Imports come first in the function
    /// index space.
    pub num_imported_functions: usize,

    /// Types of all functions, imported and defined.
    pub functions: PrimaryMap<FunctionIndex, FunctionType>,

    /// Function names from the name section.
    pub function_names: HashMap<FunctionIndex, String>,

    /// How the module's code moves between tiers.
    pub mode: CompileMode,

    /// Keep the link data of tier blocks so the code can be linked again,
    /// e.g. after serialization.
    pub keep_link_data: bool,
}

impl ModuleMetadata {
    /// Creates metadata for a module without imports.
    pub fn new(mode: CompileMode, functions: PrimaryMap<FunctionIndex, FunctionType>) -> Self {
        Self {
            name: None,
            num_imported_functions: 0,
            functions,
            function_names: HashMap::new(),
            mode,
            keep_link_data: false,
        }
    }

    /// Get the name of this module.
    pub fn name(&self) -> String {
        match self.name {
            Some(ref name) => name.to_string(),
            None => "<module>".to_string(),
        }
    }

    /// Total number of functions, imported and defined.
    pub fn num_funcs(&self) -> usize {
        self.functions.len()
    }

    /// Test whether the given function index is for an imported function.
    pub fn is_imported_function(&self, index: FunctionIndex) -> bool {
        index.index() < self.num_imported_functions
    }

    /// Iterate over the functions defined by the module itself.
    pub fn defined_functions(&self) -> impl Iterator<Item = FunctionIndex> + '_ {
        self.functions
            .keys()
            .skip(self.num_imported_functions)
    }

    /// The type of a function.
    pub fn func_type(&self, index: FunctionIndex) -> &FunctionType {
        &self.functions[index]
    }

    /// The display name of a function: its name-section entry if there is
    /// one, `func<N>` otherwise.
    pub fn func_name(&self, index: FunctionIndex) -> String {
        self.function_names
            .get(&index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}
