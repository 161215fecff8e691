//! Patch records a code generator emits alongside its machine code.
use crate::indexes::FunctionIndex;
use crate::CodeOffset;
use enum_iterator::IntoEnumIterator;
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value a symbolic patch site holds until it is linked. The linker refuses
/// to patch a site that does not hold it.
pub const SYMBOLIC_PLACEHOLDER: u64 = u64::MAX;

/// Value an internal-link patch site holds until it is linked.
pub const INTERNAL_PLACEHOLDER: u64 = 0;

/// How a patch site encodes its target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RelocationKind {
    /// Absolute 8-byte address.
    Abs8,
    /// 4-byte displacement relative to the end of the patched field.
    PCRel4,
}

impl RelocationKind {
    /// Width of the patched field in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::Abs8 => 8,
            Self::PCRel4 => 4,
        }
    }
}

/// A reference from one place in a code blob to another place in the same
/// blob, resolved once the blob's final address is known.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct InternalLink {
    /// Offset of the field to patch.
    pub patch_at_offset: CodeOffset,
    /// Offset the field must refer to.
    pub target_offset: CodeOffset,
    /// Encoding of the field.
    pub kind: RelocationKind,
}

/// Process-wide helpers that generated code calls or reads by absolute
/// address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, IntoEnumIterator)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u16)]
pub enum SymbolicAddress {
    /// Entered by the trap exit stub.
    HandleTrap,
    /// Entered when a Wasm exception unwinds out of a frame.
    HandleThrow,
    /// Entered by interrupt checks.
    HandleInterrupt,
    /// Slow path of `memory.grow`.
    MemoryGrow,
    /// Slow path of `memory.size`.
    MemorySize,
    /// Slow path of `table.grow`.
    TableGrow,
    /// Calls through the interpreter into an import.
    CallImportInterp,
    /// Entered from the tier entry when lazy tiering requests a better tier.
    RequestTierUp,
    /// Entered by debugger breakpoints.
    HandleDebugTrap,
    /// `f64.ceil`.
    CeilF64,
    /// `f64.floor`.
    FloorF64,
}

impl fmt::Display for SymbolicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A jump from a partial tier to whatever code is currently the best for
/// another function. The site holds an absolute 8-byte target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FarJump {
    /// Function to jump to.
    pub func_index: FunctionIndex,
    /// Offset of the target field.
    pub jump_offset: CodeOffset,
}

/// Every patch a freshly copied code blob needs before it can run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LinkData {
    /// Links within the blob.
    pub internal_links: Vec<InternalLink>,
    /// Absolute 8-byte references to runtime helpers, grouped by helper.
    /// Indexed by `SymbolicAddress as usize`.
    symbolic_links: Vec<Vec<CodeOffset>>,
    /// Jumps to other functions' best code.
    pub far_jumps: Vec<FarJump>,
}

impl LinkData {
    /// Create empty link data.
    pub fn new() -> Self {
        Self {
            internal_links: Vec::new(),
            symbolic_links: vec![Vec::new(); SymbolicAddress::VARIANT_COUNT],
            far_jumps: Vec::new(),
        }
    }

    /// Record that the 8 bytes at `offset` must hold the address of `symbol`.
    pub fn add_symbolic_link(&mut self, symbol: SymbolicAddress, offset: CodeOffset) {
        if self.symbolic_links.is_empty() {
            self.symbolic_links = vec![Vec::new(); SymbolicAddress::VARIANT_COUNT];
        }
        self.symbolic_links[symbol as usize].push(offset);
    }

    /// Patch sites recorded for `symbol`.
    pub fn symbolic_links(&self, symbol: SymbolicAddress) -> &[CodeOffset] {
        self.symbolic_links
            .get(symbol as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate over all helpers that have at least one patch site.
    pub fn symbols(&self) -> impl Iterator<Item = (SymbolicAddress, &[CodeOffset])> + '_ {
        SymbolicAddress::into_enum_iter()
            .map(move |symbol| (symbol, self.symbolic_links(symbol)))
            .filter(|(_, offsets)| !offsets.is_empty())
    }

    /// Whether nothing needs patching.
    pub fn is_empty(&self) -> bool {
        self.internal_links.is_empty()
            && self.far_jumps.is_empty()
            && self.symbolic_links.iter().all(Vec::is_empty)
    }
}
