//! Semantic regions of machine code within a code block.
use crate::indexes::FunctionIndex;
use crate::CodeOffset;
use enumset::{EnumSet, EnumSetType};
use more_asserts::{assert_le, debug_assert_le};
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// What a [`CodeRange`] contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CodeRangeKind {
    /// The body of a Wasm function.
    Function {
        /// The function compiled into this range.
        func_index: FunctionIndex,
        /// Entry used by direct calls that already checked the signature,
        /// relative to the start of the range.
        unchecked_call_entry: CodeOffset,
        /// Entry through which baseline code switches to a better tier,
        /// relative to the start of the range.
        tier_entry: CodeOffset,
    },
    /// Trampoline entered from the interpreter calling convention.
    InterpEntry {
        /// The function this trampoline calls.
        func_index: FunctionIndex,
    },
    /// Trampoline entered directly from JIT-compiled host code.
    JitEntry {
        /// The function this trampoline calls.
        func_index: FunctionIndex,
    },
    /// Exit from Wasm into an imported function through the interpreter.
    ImportInterpExit {
        /// The imported function.
        func_index: FunctionIndex,
    },
    /// Exit from Wasm into an imported function that has JIT code.
    ImportJitExit {
        /// The imported function.
        func_index: FunctionIndex,
    },
    /// Shared stub every trap site jumps to.
    TrapExit,
    /// Island of far jumps used to reach another block.
    FarJumpIsland,
}

/// Fieldless mirror of [`CodeRangeKind`], used to select sets of kinds.
#[derive(Debug, Hash, EnumSetType)]
pub enum CodeRangeKindTag {
    /// See [`CodeRangeKind::Function`].
    Function,
    /// See [`CodeRangeKind::InterpEntry`].
    InterpEntry,
    /// See [`CodeRangeKind::JitEntry`].
    JitEntry,
    /// See [`CodeRangeKind::ImportInterpExit`].
    ImportInterpExit,
    /// See [`CodeRangeKind::ImportJitExit`].
    ImportJitExit,
    /// See [`CodeRangeKind::TrapExit`].
    TrapExit,
    /// See [`CodeRangeKind::FarJumpIsland`].
    FarJumpIsland,
}

impl CodeRangeKind {
    /// The tag of this kind.
    pub fn tag(&self) -> CodeRangeKindTag {
        match self {
            Self::Function { .. } => CodeRangeKindTag::Function,
            Self::InterpEntry { .. } => CodeRangeKindTag::InterpEntry,
            Self::JitEntry { .. } => CodeRangeKindTag::JitEntry,
            Self::ImportInterpExit { .. } => CodeRangeKindTag::ImportInterpExit,
            Self::ImportJitExit { .. } => CodeRangeKindTag::ImportJitExit,
            Self::TrapExit => CodeRangeKindTag::TrapExit,
            Self::FarJumpIsland => CodeRangeKindTag::FarJumpIsland,
        }
    }
}

/// A contiguous `[begin, end)` region of a block's code, with offsets
/// relative to the base of the segment the block lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeRange {
    kind: CodeRangeKind,
    begin: CodeOffset,
    end: CodeOffset,
}

impl CodeRange {
    /// Creates a new range. `begin` must not be past `end`.
    pub fn new(kind: CodeRangeKind, begin: CodeOffset, end: CodeOffset) -> Self {
        assert!(begin <= end, "code range {begin:#x}..{end:#x} is inverted");
        if let CodeRangeKind::Function {
            unchecked_call_entry,
            tier_entry,
            ..
        } = kind
        {
            debug_assert_le!(unchecked_call_entry, end - begin);
            debug_assert_le!(tier_entry, end - begin);
        }
        Self { kind, begin, end }
    }

    /// The kind of this range.
    pub fn kind(&self) -> CodeRangeKind {
        self.kind
    }

    /// Start offset.
    pub fn begin(&self) -> CodeOffset {
        self.begin
    }

    /// End offset (exclusive).
    pub fn end(&self) -> CodeOffset {
        self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Whether `offset` lies inside `[begin, end)`.
    pub fn contains(&self, offset: CodeOffset) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// The function this range belongs to, if any.
    pub fn func_index(&self) -> Option<FunctionIndex> {
        match self.kind {
            CodeRangeKind::Function { func_index, .. }
            | CodeRangeKind::InterpEntry { func_index }
            | CodeRangeKind::JitEntry { func_index }
            | CodeRangeKind::ImportInterpExit { func_index }
            | CodeRangeKind::ImportJitExit { func_index } => Some(func_index),
            CodeRangeKind::TrapExit | CodeRangeKind::FarJumpIsland => None,
        }
    }

    /// Whether this is a function body.
    pub fn is_function(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Function { .. })
    }

    /// Whether this is an interpreter entry stub.
    pub fn is_interp_entry(&self) -> bool {
        matches!(self.kind, CodeRangeKind::InterpEntry { .. })
    }

    /// Whether this is a JIT entry stub.
    pub fn is_jit_entry(&self) -> bool {
        matches!(self.kind, CodeRangeKind::JitEntry { .. })
    }

    /// Absolute offset of the unchecked call entry of a function body.
    ///
    /// Panics if this is not a function range.
    pub fn func_unchecked_call_entry(&self) -> CodeOffset {
        match self.kind {
            CodeRangeKind::Function {
                unchecked_call_entry,
                ..
            } => self.begin + unchecked_call_entry,
            kind => panic!("{kind:?} has no unchecked call entry"),
        }
    }

    /// Absolute offset of the tier entry of a function body.
    ///
    /// Panics if this is not a function range.
    pub fn func_tier_entry(&self) -> CodeOffset {
        match self.kind {
            CodeRangeKind::Function { tier_entry, .. } => self.begin + tier_entry,
            kind => panic!("{kind:?} has no tier entry"),
        }
    }

    /// Whether this range's kind is part of `kinds`.
    pub fn is_any_of(&self, kinds: EnumSet<CodeRangeKindTag>) -> bool {
        kinds.contains(self.kind.tag())
    }

    /// Shift the range by `delta` bytes.
    pub fn offset_by(&mut self, delta: CodeOffset) {
        self.begin += delta;
        self.end += delta;
    }
}

/// Find the range covering `target` in `ranges`, which must be sorted by
/// `begin` and pairwise disjoint.
pub fn lookup_code_range(ranges: &[CodeRange], target: CodeOffset) -> Option<&CodeRange> {
    let idx = ranges.partition_point(|range| range.end <= target);
    ranges.get(idx).filter(|range| range.begin <= target)
}
