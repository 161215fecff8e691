//! Output of the (external) code generator.
use crate::indexes::FunctionIndex;
use crate::link_data::LinkData;
use crate::metadata::CodeMetadata;
use crate::types::FunctionType;

/// A unit of machine code as it leaves the code generator. Every offset in
/// `link_data` and `metadata` is relative to the first byte of `bytes`.
#[derive(Debug, Clone, Default)]
pub struct CompiledCode {
    /// The machine code.
    pub bytes: Vec<u8>,
    /// Patches to apply once the final address is known.
    pub link_data: LinkData,
    /// Offset-keyed tables describing `bytes`.
    pub metadata: CodeMetadata,
}

impl CompiledCode {
    /// Whether there is no code at all.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One function in a batch of entry stubs to generate.
#[derive(Debug, Clone, Copy)]
pub struct EntryStubRequest<'a> {
    /// Function the stubs enter.
    pub func_index: FunctionIndex,
    /// Its signature.
    pub func_type: &'a FunctionType,
    /// Absolute address of the function's unchecked call entry.
    pub callee: usize,
    /// Emit a JIT entry after the interpreter entry.
    pub with_jit_entry: bool,
}
