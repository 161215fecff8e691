//! The code of one module: every block produced for it over its lifetime.

use crate::block::{CodeBlock, CodeBlockKind};
use crate::lazy_stubs::{LazyFuncExport, LazyStubTier};
use crate::runtime::{CodeId, ProcessRuntimeState};
use crate::segment::CodeSegment;
use crate::traits::CodeGenerator;
use enumset::EnumSet;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use wasmer_code_types::entity::{EntityRef, PrimaryMap};
use wasmer_code_types::{
    CallSite, CodeBlockIndex, CodeRange, CodeRangeKindTag, CodeRangeUnwindInfo, CompileError,
    CompileMode, CompiledCode, FunctionIndex, LinkData, ModuleMetadata, StackMap, Tier,
    TierUpState, TrapSite, TryNote,
};
use wasmer_code_vm::{defer_until_lookups_end, in_code_map_lookup, JumpTables};

/// Everything guarded by the `Code` lock.
#[derive(Default)]
pub(crate) struct CodeData {
    pub(crate) blocks: PrimaryMap<CodeBlockIndex, Arc<CodeBlock>>,
    /// Parallel to `blocks`.
    pub(crate) link_data: PrimaryMap<CodeBlockIndex, Option<LinkData>>,
    pub(crate) lazy_stubs: LazyStubTier,
}

/// Lazy tiering state of one function.
struct FuncState {
    /// Best block with a body for the function. Null means the first tier.
    best: AtomicPtr<CodeBlock>,
    tier_up: AtomicU8,
}

impl Default for FuncState {
    fn default() -> Self {
        Self {
            best: AtomicPtr::new(ptr::null_mut()),
            tier_up: AtomicU8::new(TierUpState::NotRequested as u8),
        }
    }
}

/// All the machine code of a module.
///
/// The first tier is installed when the `Code` is created. Optimized code
/// arrives later from helper threads, either for the whole module at once
/// ([`CompileMode::EagerTiering`]) or function by function
/// ([`CompileMode::LazyTiering`]). Entry stubs the first tier did not
/// generate eagerly are created on first use.
///
/// Blocks are never removed before the `Code` itself is dropped, so a
/// pointer to a block obtained from a `Code` stays valid as long as the
/// `Code` does.
pub struct Code {
    weak_self: Weak<Code>,
    id: CodeId,
    runtime: Arc<ProcessRuntimeState>,
    module: Arc<ModuleMetadata>,
    generator: Arc<dyn CodeGenerator>,
    shared_stubs: Option<Arc<CodeBlock>>,
    tier1: Arc<CodeBlock>,
    /// Set once, before `has_complete_tier2`.
    pub(crate) tier2: OnceLock<Arc<CodeBlock>>,
    pub(crate) has_complete_tier2: AtomicBool,
    pub(crate) data: RwLock<CodeData>,
    jump_tables: JumpTables,
    funcs: Box<[FuncState]>,
    profiling_labels: Mutex<Option<Vec<String>>>,
    /// Cancel flags of background tasks that may still be running.
    background: Mutex<Vec<Arc<AtomicBool>>>,
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Code")
            .field("id", &self.id)
            .field("module", &self.module.name())
            .field("mode", &self.module.mode)
            .field("tier1", &self.tier1)
            .field("has_complete_tier2", &self.has_complete_tier2())
            .finish()
    }
}

fn create_block(
    runtime: &ProcessRuntimeState,
    kind: CodeBlockKind,
    tier: Tier,
    compiled: CompiledCode,
) -> Result<(Arc<CodeBlock>, LinkData), CompileError> {
    let CompiledCode {
        bytes,
        link_data,
        metadata,
    } = compiled;
    let segment = CodeSegment::create_from_bytes(
        runtime.allocator(),
        &bytes,
        &link_data,
        runtime.symbols(),
        None,
    )?;
    let block = CodeBlock::new(kind, tier, segment, 0, bytes.len(), metadata);
    Ok((Arc::new(block), link_data))
}

impl Code {
    /// Install the first tier of a module.
    ///
    /// `tier1` holds every defined function at `tier`, which must be the
    /// baseline tier when the module tiers up. `shared_stubs` holds code
    /// shared by all tiers, such as trap exits.
    pub fn new(
        runtime: &Arc<ProcessRuntimeState>,
        module: Arc<ModuleMetadata>,
        generator: Arc<dyn CodeGenerator>,
        tier: Tier,
        tier1: CompiledCode,
        shared_stubs: Option<CompiledCode>,
    ) -> Result<Arc<Self>, CompileError> {
        let mode = module.mode;
        if mode.is_tiering() {
            assert_eq!(tier, Tier::Baseline, "a tiering module starts at the baseline tier");
        }

        let shared_stubs = shared_stubs
            .filter(|stubs| !stubs.is_empty())
            .map(|stubs| create_block(runtime, CodeBlockKind::SharedStubs, tier, stubs))
            .transpose()?;
        let tier1_kind = match tier {
            Tier::Baseline => CodeBlockKind::BaselineTier,
            Tier::Optimized => CodeBlockKind::OptimizedTier,
        };
        let (tier1_block, tier1_link_data) = create_block(runtime, tier1_kind, tier, tier1)?;

        let num_funcs = module.num_funcs();
        let code = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            id: runtime.next_code_id(),
            runtime: runtime.clone(),
            module,
            generator,
            shared_stubs: shared_stubs.as_ref().map(|(block, _)| block.clone()),
            tier1: tier1_block.clone(),
            tier2: OnceLock::new(),
            has_complete_tier2: AtomicBool::new(false),
            data: RwLock::new(CodeData::default()),
            jump_tables: JumpTables::new(mode, num_funcs),
            funcs: (0..num_funcs).map(|_| FuncState::default()).collect(),
            profiling_labels: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        });

        {
            let mut data = code.data.write();
            if let Some((block, link_data)) = shared_stubs {
                code.add_code_block(&mut data, block, Some(link_data))?;
            }
            code.add_code_block(&mut data, tier1_block, Some(tier1_link_data))?;
        }
        code.init_jump_tables();

        tracing::debug!(
            code = %code.id,
            module = %code.module.name(),
            ?mode,
            %tier,
            num_funcs,
            "code created"
        );
        Ok(code)
    }

    fn init_jump_tables(&self) {
        let tier1 = &*self.tier1;
        if self.mode().is_tiering() {
            for func_index in self.module.defined_functions() {
                if let Some(entry) = tier1.func_tier_entry(func_index) {
                    self.jump_tables
                        .set_tiering_entry(func_index, entry as *const u8);
                }
            }
        }
        self.publish_jit_entries(tier1, false);
    }

    /// Point the JIT table at the JIT entries of `block`. Eager entries of
    /// the first tier never replace entries created lazily in the meantime.
    pub(crate) fn publish_jit_entries(&self, block: &CodeBlock, replace: bool) {
        for range in block.code_ranges().iter().filter(|range| range.is_jit_entry()) {
            let Some(func_index) = range.func_index() else {
                continue;
            };
            let entry = block.address_of(range.begin()) as *const u8;
            if replace {
                self.jump_tables.set_jit_entry(func_index, entry);
            } else {
                self.jump_tables.set_jit_entry_if_null(func_index, entry);
            }
        }
    }

    /// Publish `block`, then append it. A block that fails to publish is
    /// not kept.
    ///
    /// Link data is only kept for tier blocks, and only when the module
    /// asks for it.
    pub(crate) fn add_code_block(
        &self,
        data: &mut CodeData,
        block: Arc<CodeBlock>,
        link_data: Option<LinkData>,
    ) -> Result<CodeBlockIndex, CompileError> {
        let link_data = link_data.filter(|_| self.module.keep_link_data && block.kind().is_tier());
        let index = data.blocks.next_key();
        block.initialize(
            self.weak_self.clone(),
            self.id,
            index,
            &self.runtime,
            &self.module,
        )?;
        data.blocks.push(block);
        data.link_data.push(link_data);
        Ok(index)
    }

    /// Process-unique identity.
    pub fn id(&self) -> CodeId {
        self.id
    }

    /// The runtime the code is registered with.
    pub fn runtime(&self) -> &Arc<ProcessRuntimeState> {
        &self.runtime
    }

    /// Module facts shared by every tier.
    pub fn module(&self) -> &ModuleMetadata {
        &self.module
    }

    pub(crate) fn generator(&self) -> &dyn CodeGenerator {
        &*self.generator
    }

    pub(crate) fn weak(&self) -> Weak<Code> {
        self.weak_self.clone()
    }

    /// How the code moves between tiers.
    pub fn mode(&self) -> CompileMode {
        self.module.mode
    }

    /// Tiering and JIT entry tables.
    pub fn jump_tables(&self) -> &JumpTables {
        &self.jump_tables
    }

    /// The shared stubs block, if the module has one.
    pub fn shared_stubs(&self) -> Option<&Arc<CodeBlock>> {
        self.shared_stubs.as_ref()
    }

    /// The first tier block.
    pub fn tier1(&self) -> &Arc<CodeBlock> {
        &self.tier1
    }

    /// Whether the whole module runs optimized code.
    pub fn has_complete_tier2(&self) -> bool {
        self.has_complete_tier2.load(Ordering::Acquire)
    }

    /// The complete optimized tier, once installed.
    pub fn tier2(&self) -> Option<&Arc<CodeBlock>> {
        if self.has_complete_tier2() {
            self.tier2.get()
        } else {
            None
        }
    }

    fn best_complete_block(&self) -> &CodeBlock {
        self.tier2().unwrap_or(&self.tier1)
    }

    /// Best tier available for the whole module.
    pub fn best_complete_tier(&self) -> Tier {
        self.best_complete_block().tier()
    }

    /// The block holding the best body of `func_index`.
    pub fn func_code_block(&self, func_index: FunctionIndex) -> &CodeBlock {
        if self.mode() != CompileMode::LazyTiering {
            return self.best_complete_block();
        }
        let best = self.funcs[func_index.index()].best.load(Ordering::Acquire);
        if best.is_null() {
            &self.tier1
        } else {
            // Blocks live as long as the code that owns them.
            unsafe { &*best }
        }
    }

    pub(crate) fn set_func_code_block(&self, func_index: FunctionIndex, block: &Arc<CodeBlock>) {
        self.funcs[func_index.index()]
            .best
            .store(Arc::as_ptr(block).cast_mut(), Ordering::Release);
    }

    /// Best tier `func_index` runs at.
    pub fn best_tier(&self, func_index: FunctionIndex) -> Tier {
        self.func_code_block(func_index).tier()
    }

    /// Current best unchecked call entry of `func_index`, as far jumps
    /// need it.
    pub(crate) fn func_best_entry(&self, func_index: FunctionIndex) -> usize {
        self.func_code_block(func_index)
            .func_unchecked_call_entry(func_index)
            .unwrap_or_else(|| panic!("far jump to {func_index}, which has no code"))
    }

    /// Lazy tiering state of `func_index`.
    pub fn tier_up_state(&self, func_index: FunctionIndex) -> TierUpState {
        TierUpState::from_u8(self.funcs[func_index.index()].tier_up.load(Ordering::Acquire))
    }

    pub(crate) fn tier_up_slot(&self, func_index: FunctionIndex) -> &AtomicU8 {
        &self.funcs[func_index.index()].tier_up
    }

    /// Number of blocks added so far.
    pub fn num_code_blocks(&self) -> usize {
        self.data.read().blocks.len()
    }

    /// The block at `index`.
    pub fn code_block(&self, index: CodeBlockIndex) -> Option<Arc<CodeBlock>> {
        self.data.read().blocks.get(index).cloned()
    }

    /// Link data retained for the block at `index`.
    pub fn link_data(&self, index: CodeBlockIndex) -> Option<LinkData> {
        self.data.read().link_data.get(index).cloned().flatten()
    }

    /// Where the lazy stubs of `func_index` live, if it has any.
    pub fn lookup_stub(&self, func_index: FunctionIndex) -> Option<LazyFuncExport> {
        self.data.read().lazy_stubs.lookup(func_index).copied()
    }

    fn lazy_interp_entry(data: &CodeData, func_index: FunctionIndex) -> Option<usize> {
        let export = data.lazy_stubs.lookup(func_index)?;
        let block = &data.blocks[export.block_index];
        Some(block.address_of(block.code_range(export.func_code_range_index).begin()))
    }

    /// Address of the interpreter entry of the exported function
    /// `func_index`, generating the stub if needed.
    ///
    /// Panics if the function is not exported.
    pub fn get_or_create_interp_entry(
        &self,
        func_index: FunctionIndex,
    ) -> Result<usize, CompileError> {
        // Every export has an entry in the first tier.
        self.tier1.lookup_func_export(func_index);

        let block = self.func_code_block(func_index);
        if let Some((_, export)) = block.metadata().lookup_func_export(func_index) {
            if let Some(offset) = export.eager_interp_entry_offset {
                return Ok(block.address_of(offset));
            }
        }

        if let Some(entry) = Self::lazy_interp_entry(&self.data.read(), func_index) {
            return Ok(entry);
        }
        let mut data = self.data.write();
        if let Some(entry) = Self::lazy_interp_entry(&data, func_index) {
            return Ok(entry);
        }
        let index = self.create_one_entry_stub_locked(&mut data, func_index)?;
        let block = &data.blocks[index];
        Ok(block.address_of(block.code_ranges()[0].begin()))
    }

    /// Generate entry stubs for `func_index` calling its best tier,
    /// replacing any it already has.
    pub fn create_one_entry_stub(
        &self,
        func_index: FunctionIndex,
    ) -> Result<CodeBlockIndex, CompileError> {
        let mut data = self.data.write();
        self.create_one_entry_stub_locked(&mut data, func_index)
    }

    fn create_one_entry_stub_locked(
        &self,
        data: &mut CodeData,
        func_index: FunctionIndex,
    ) -> Result<CodeBlockIndex, CompileError> {
        let tier_block = self.func_code_block(func_index);
        let index = self.create_many_entry_stubs(data, &[func_index], tier_block)?;
        self.publish_jit_entries(&data.blocks[index], true);
        Ok(index)
    }

    fn with_own_block<R>(&self, pc: usize, f: impl FnOnce(&CodeBlock) -> Option<R>) -> Option<R> {
        self.runtime
            .lookup_code_block(pc, |block| {
                if block.code_id() == Some(self.id) {
                    f(block)
                } else {
                    None
                }
            })
            .flatten()
    }

    /// Whether `pc` is inside this code.
    pub fn contains_pc(&self, pc: usize) -> bool {
        self.with_own_block(pc, |_| Some(())).is_some()
    }

    /// Kind and tier of the block containing `pc`.
    pub fn lookup_block_kind(&self, pc: usize) -> Option<(CodeBlockKind, Tier)> {
        self.with_own_block(pc, |block| Some((block.kind(), block.tier())))
    }

    /// The code range containing `pc`.
    pub fn lookup_code_range(&self, pc: usize) -> Option<CodeRange> {
        self.with_own_block(pc, |block| block.lookup_range(pc).copied())
    }

    /// The call site returning to `pc`.
    pub fn lookup_call_site(&self, pc: usize) -> Option<CallSite> {
        self.with_own_block(pc, |block| block.lookup_call_site(pc).copied())
    }

    /// The trap site at `pc`.
    pub fn lookup_trap(&self, pc: usize) -> Option<TrapSite> {
        self.with_own_block(pc, |block| block.lookup_trap(pc).copied())
    }

    /// The innermost try note covering `pc`.
    pub fn lookup_try_note(&self, pc: usize) -> Option<TryNote> {
        self.with_own_block(pc, |block| block.lookup_try_note(pc).copied())
    }

    /// Special unwind handling needed at `pc`.
    pub fn lookup_unwind_info(&self, pc: usize) -> Option<CodeRangeUnwindInfo> {
        self.with_own_block(pc, |block| block.lookup_unwind_info(pc).copied())
    }

    /// The stack map of the call returning to `pc`.
    pub fn lookup_stack_map(&self, pc: usize) -> Option<StackMap> {
        self.with_own_block(pc, |block| block.lookup_stack_map(pc).cloned())
    }

    /// Human readable label of `func_index` for profilers.
    pub fn profiling_label(&self, func_index: FunctionIndex) -> String {
        let mut labels = self.profiling_labels.lock();
        let labels = labels.get_or_insert_with(|| {
            let module_name = self.module.name();
            self.module
                .functions
                .keys()
                .map(|f| format!("{} ({}:{})", self.module.func_name(f), module_name, f.index()))
                .collect()
        });
        labels[func_index.index()].clone()
    }

    /// Print the code of every range whose kind is in `kinds`, one line of
    /// hex per 16 bytes, preceded by a header line.
    pub fn disassemble(&self, kinds: EnumSet<CodeRangeKindTag>, print: &mut dyn FnMut(&str)) {
        let data = self.data.read();
        for (index, block) in data.blocks.iter() {
            for range in block.code_ranges().iter().filter(|range| range.is_any_of(kinds)) {
                let start = block.address_of(range.begin());
                let label = match range.func_index() {
                    Some(func_index) => self.profiling_label(func_index),
                    None => String::from("-"),
                };
                print(&format!(
                    "# {:?} {} [{:#x}, {:#x}) in {} ({})",
                    range.kind().tag(),
                    label,
                    start,
                    start + range.len() as usize,
                    index,
                    block.kind()
                ));
                let bytes = block.bytes(range.begin(), range.end());
                for (line, chunk) in bytes.chunks(16).enumerate() {
                    print(&format!("{:#014x}: {}", start + line * 16, hex::encode(chunk)));
                }
            }
        }
    }

    /// A fresh cancel flag for one background task.
    pub(crate) fn new_background_task(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut background = self.background.lock();
        // Flags nobody else holds belong to finished tasks.
        background.retain(|task| Arc::strong_count(task) > 1);
        background.push(flag.clone());
        flag
    }

    /// Stop the background compilations running now as soon as possible.
    /// Their results are discarded. Compilations started later are not
    /// affected.
    pub fn cancel_background_compilation(&self) {
        let tasks = std::mem::take(&mut *self.background.lock());
        for task in &tasks {
            task.store(true, Ordering::Release);
        }
        if !tasks.is_empty() {
            tracing::debug!(
                code = %self.id,
                num_tasks = tasks.len(),
                "background compilation cancelled"
            );
        }
    }
}

impl Drop for Code {
    fn drop(&mut self) {
        self.cancel_background_compilation();
        if in_code_map_lookup() {
            // A lookup on this thread may still be reading one of our blocks.
            let data = std::mem::take(self.data.get_mut());
            defer_until_lookups_end(move || drop(data));
        }
        tracing::trace!(code = %self.id, "code dropped");
    }
}
