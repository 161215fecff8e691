//! Index types for functions, code blocks and code ranges.
use crate::entity_impl;
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Index type of a function (imported or local) inside the WebAssembly module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FunctionIndex(u32);
entity_impl!(FunctionIndex, "func");

/// Index of a `CodeBlock` within the block list of its owning `Code`.
///
/// Blocks are only ever appended, so an index stays valid for the lifetime
/// of the `Code` that handed it out.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeBlockIndex(u32);
entity_impl!(CodeBlockIndex, "block");

/// Index of a `CodeRange` within the sorted range table of one block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeRangeIndex(u32);
entity_impl!(CodeRangeIndex, "range");

impl CodeRangeIndex {
    /// The range that immediately follows this one in its block.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
