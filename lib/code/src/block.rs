//! Code blocks: registered units of code and their metadata.

use crate::code::Code;
use crate::runtime::{CodeId, ProcessRuntimeState};
use crate::segment::CodeSegment;
use more_asserts::assert_le;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{
    CallSite, CodeBlockIndex, CodeMetadata, CodeOffset, CodeRange, CodeRangeIndex,
    CodeRangeUnwindInfo, CompileError, FuncExport, FunctionIndex, ModuleMetadata, StackMap, Tier,
    TrapSite, TryNote,
};

/// What a [`CodeBlock`] holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodeBlockKind {
    /// Stubs shared by the whole module: trap exits, import exits.
    SharedStubs,
    /// The baseline tier, or the only tier of a module compiled once.
    BaselineTier,
    /// Optimized code for the whole module or for some functions.
    OptimizedTier,
    /// Entry stubs generated on first use.
    LazyStubs,
}

impl CodeBlockKind {
    /// Whether the block holds function bodies.
    pub fn is_tier(self) -> bool {
        matches!(self, Self::BaselineTier | Self::OptimizedTier)
    }
}

impl fmt::Display for CodeBlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SharedStubs => "shared stubs",
            Self::BaselineTier => "baseline tier",
            Self::OptimizedTier => "optimized tier",
            Self::LazyStubs => "lazy stubs",
        })
    }
}

#[derive(Debug)]
struct BlockOwner {
    code: Weak<Code>,
    code_id: CodeId,
    index: CodeBlockIndex,
}

/// A range of a [`CodeSegment`] together with the tables describing the
/// code in it.
///
/// A block becomes visible to other threads in exactly one step:
/// [`CodeBlock::initialize`] registers it in the process code map, after
/// which its metadata never changes. It unregisters itself when dropped.
pub struct CodeBlock {
    kind: CodeBlockKind,
    tier: Tier,
    segment: Arc<CodeSegment>,
    code_start: usize,
    code_length: usize,
    metadata: CodeMetadata,
    func_to_code_range: HashMap<FunctionIndex, CodeRangeIndex>,
    owner: OnceLock<BlockOwner>,
    registered: OnceLock<Arc<ProcessRuntimeState>>,
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("kind", &self.kind)
            .field("tier", &self.tier)
            .field("code_start", &format_args!("{:#x}", self.code_base()))
            .field("code_length", &self.code_length)
            .field("num_code_ranges", &self.metadata.code_ranges.len())
            .field("owner", &self.owner.get().map(|owner| owner.code_id))
            .finish()
    }
}

impl CodeBlock {
    /// Wrap `[code_start, code_start + code_length)` of `segment`.
    ///
    /// `metadata` is relative to the first byte of the code, as emitted by
    /// the generator. It is normalized and rebased to segment offsets here.
    pub fn new(
        kind: CodeBlockKind,
        tier: Tier,
        segment: Arc<CodeSegment>,
        code_start: usize,
        code_length: usize,
        mut metadata: CodeMetadata,
    ) -> Self {
        assert_le!(code_start + code_length, segment.length());
        metadata.normalize();
        if let Some(last) = metadata.code_ranges.last() {
            assert_le!(last.end() as usize, code_length, "code range past the end of the code");
        }
        let mut block = Self {
            kind,
            tier,
            segment,
            code_start,
            code_length,
            metadata,
            func_to_code_range: HashMap::new(),
            owner: OnceLock::new(),
            registered: OnceLock::new(),
        };
        block.offset_metadata_by(code_start as CodeOffset);
        block.func_to_code_range = block
            .metadata
            .code_ranges
            .iter()
            .enumerate()
            .filter(|(_, range)| range.is_function())
            .filter_map(|(i, range)| Some((range.func_index()?, CodeRangeIndex::new(i))))
            .collect();
        block
    }

    /// Rebase every offset in the metadata by `delta`. Only allowed before
    /// the block is published.
    pub fn offset_metadata_by(&mut self, delta: CodeOffset) {
        assert!(
            self.owner.get().is_none(),
            "metadata of a published block cannot move"
        );
        self.metadata.offset_by(delta);
    }

    /// Bind the block to its `Code` and publish it.
    ///
    /// Registration in the process code map is the last step: from then on
    /// any thread can find and run the block.
    pub(crate) fn initialize(
        &self,
        code: Weak<Code>,
        code_id: CodeId,
        index: CodeBlockIndex,
        runtime: &Arc<ProcessRuntimeState>,
        module: &ModuleMetadata,
    ) -> Result<(), CompileError> {
        let owner = BlockOwner {
            code,
            code_id,
            index,
        };
        assert!(
            self.owner.set(owner).is_ok(),
            "code block initialized twice"
        );
        self.segment.set_owner(code_id);

        if let Some(profiler) = runtime.profiler() {
            for range in &self.metadata.code_ranges {
                if let Some(func_index) = range.func_index() {
                    let name = format!(
                        "{} ({:?}, {})",
                        module.func_name(func_index),
                        range.kind().tag(),
                        self.tier
                    );
                    profiler.register_code_range(
                        &name,
                        self.address_of(range.begin()),
                        range.len() as usize,
                    );
                }
            }
        }

        if self.code_length == 0 {
            return Ok(());
        }
        runtime.register_code_block(self)?;
        // Only read by `drop`.
        let _ = self.registered.set(runtime.clone());
        tracing::trace!(
            code = %code_id,
            block = %index,
            kind = %self.kind,
            start = self.code_base(),
            len = self.code_length,
            "code block registered"
        );
        Ok(())
    }

    /// What the block holds.
    pub fn kind(&self) -> CodeBlockKind {
        self.kind
    }

    /// The tier of the code in, or called by, this block.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The segment the block lives in.
    pub fn segment(&self) -> &Arc<CodeSegment> {
        &self.segment
    }

    /// Address of the first byte of the block's code.
    pub fn code_base(&self) -> usize {
        self.segment.base() + self.code_start
    }

    /// Length of the block's code.
    pub fn code_length(&self) -> usize {
        self.code_length
    }

    pub(crate) fn code_bounds(&self) -> (usize, usize) {
        let start = self.code_base();
        (start, start + self.code_length)
    }

    /// Whether `pc` is inside the block's code.
    pub fn contains_pc(&self, pc: usize) -> bool {
        let (start, end) = self.code_bounds();
        start <= pc && pc < end
    }

    /// Absolute address of a segment offset.
    pub fn address_of(&self, offset: CodeOffset) -> usize {
        self.segment.base() + offset as usize
    }

    fn offset_of(&self, pc: usize) -> Option<CodeOffset> {
        if !self.contains_pc(pc) {
            return None;
        }
        Some((pc - self.segment.base()) as CodeOffset)
    }

    /// The metadata tables, with segment-relative offsets.
    pub fn metadata(&self) -> &CodeMetadata {
        &self.metadata
    }

    /// The `Code` the block belongs to, if it is still alive.
    pub fn code(&self) -> Option<Arc<Code>> {
        self.owner.get()?.code.upgrade()
    }

    /// Identity of the owning `Code`, once initialized.
    pub fn code_id(&self) -> Option<CodeId> {
        self.owner.get().map(|owner| owner.code_id)
    }

    /// Index of the block in its `Code`, once initialized.
    pub fn index(&self) -> Option<CodeBlockIndex> {
        self.owner.get().map(|owner| owner.index)
    }

    /// Whether the block is visible in the process code map.
    pub fn is_registered(&self) -> bool {
        self.registered.get().is_some()
    }

    /// The code ranges, sorted by address.
    pub fn code_ranges(&self) -> &[CodeRange] {
        &self.metadata.code_ranges
    }

    /// The code range at `index`.
    pub fn code_range(&self, index: CodeRangeIndex) -> &CodeRange {
        &self.metadata.code_ranges[index.index()]
    }

    /// The body of `func_index` in this block.
    pub fn func_code_range(&self, func_index: FunctionIndex) -> Option<&CodeRange> {
        self.func_to_code_range
            .get(&func_index)
            .map(|index| self.code_range(*index))
    }

    /// Absolute address of the unchecked call entry of `func_index`.
    pub fn func_unchecked_call_entry(&self, func_index: FunctionIndex) -> Option<usize> {
        self.func_code_range(func_index)
            .map(|range| self.address_of(range.func_unchecked_call_entry()))
    }

    /// Absolute address of the tier entry of `func_index`.
    pub fn func_tier_entry(&self, func_index: FunctionIndex) -> Option<usize> {
        self.func_code_range(func_index)
            .map(|range| self.address_of(range.func_tier_entry()))
    }

    /// Functions with a body in this block.
    pub fn functions(&self) -> impl Iterator<Item = FunctionIndex> + '_ {
        self.func_to_code_range.keys().copied()
    }

    /// The code range containing `pc`.
    pub fn lookup_range(&self, pc: usize) -> Option<&CodeRange> {
        self.metadata.lookup_range(self.offset_of(pc)?)
    }

    /// The call site returning to `pc`.
    pub fn lookup_call_site(&self, pc: usize) -> Option<&CallSite> {
        self.metadata.lookup_call_site(self.offset_of(pc)?)
    }

    /// The trap site at `pc`.
    pub fn lookup_trap(&self, pc: usize) -> Option<&TrapSite> {
        self.metadata.lookup_trap(self.offset_of(pc)?)
    }

    /// The innermost try note covering `pc`.
    pub fn lookup_try_note(&self, pc: usize) -> Option<&TryNote> {
        self.metadata.lookup_try_note(self.offset_of(pc)?)
    }

    /// Special unwind handling needed at `pc`, `None` for a complete frame.
    pub fn lookup_unwind_info(&self, pc: usize) -> Option<&CodeRangeUnwindInfo> {
        self.metadata.lookup_unwind_info(self.offset_of(pc)?)
    }

    /// The stack map of the call returning to `pc`.
    pub fn lookup_stack_map(&self, pc: usize) -> Option<&StackMap> {
        self.metadata.lookup_stack_map(self.offset_of(pc)?)
    }

    /// The export entry of `func_index` and its position in the export
    /// table.
    ///
    /// Panics if the function has no entry: every exported function has
    /// one.
    pub fn lookup_func_export(&self, func_index: FunctionIndex) -> (usize, &FuncExport) {
        self.metadata
            .lookup_func_export(func_index)
            .unwrap_or_else(|| panic!("{func_index} has no export in the {} block", self.kind))
    }

    /// Bytes of the published code at segment offsets `[begin, end)`.
    pub fn bytes(&self, begin: CodeOffset, end: CodeOffset) -> &[u8] {
        self.segment.bytes(begin as usize, (end - begin) as usize)
    }
}

impl Drop for CodeBlock {
    fn drop(&mut self) {
        if let Some(runtime) = self.registered.get() {
            runtime.unregister_code_block(self);
        }
    }
}
