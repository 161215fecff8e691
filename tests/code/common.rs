//! A code generator and helper thread pool good enough to drive the code
//! layer without compiling any real Wasm.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wasmer_code::{CodeGenerator, HelperThreads, ProcessRuntimeState};
use wasmer_code_types::entity::{EntityRef, PrimaryMap};
use wasmer_code_types::{
    CodeMetadata, CodeRange, CodeRangeIndex, CodeRangeKind, CodeTunables, CompileError,
    CompileMode, CompiledCode, EntryStubRequest, FarJump, FuncExport, FunctionIndex, FunctionType,
    LinkData, ModuleMetadata, ScheduleError, SymbolicAddress, Tier, TrapCode, TrapSite, Type,
    SYMBOLIC_PLACEHOLDER,
};

/// Size of every function body.
pub const FUNC_SIZE: u32 = 32;
/// Size of every entry stub.
pub const STUB_SIZE: u32 = 16;
/// Offset of the tier entry inside a body.
pub const TIER_ENTRY: u32 = 8;
/// Offset of the trap site inside a body.
pub const TRAP_OFFSET: u32 = 4;
/// Offset of the far jump to function 0 inside optimized bodies.
pub const FAR_JUMP_OFFSET: u32 = 16;
/// Offset of the symbolic patch site inside bodies and stubs.
pub const SYMBOL_OFFSET: u32 = 24;

/// Byte filling baseline bodies.
pub const BASELINE_FILL: u8 = 0xcc;
/// Byte filling optimized bodies.
pub const OPTIMIZED_FILL: u8 = 0x90;

pub fn resolve_symbol(symbol: SymbolicAddress) -> usize {
    0x5000_0000 + symbol as usize * 0x10
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// `num_funcs` defined functions. The last one takes a `v128` and cannot
/// have a JIT entry.
pub fn module(mode: CompileMode, num_funcs: usize) -> Arc<ModuleMetadata> {
    let mut functions = PrimaryMap::new();
    for i in 0..num_funcs {
        let ty = if i + 1 == num_funcs && num_funcs > 1 {
            FunctionType::new([Type::V128], Vec::<Type>::new())
        } else {
            FunctionType::new([Type::I32], [Type::I32])
        };
        functions.push(ty);
    }
    let mut module = ModuleMetadata::new(mode, functions);
    module.name = Some("test".to_string());
    module.keep_link_data = true;
    Arc::new(module)
}

/// Compile `funcs` as one unit, every function exported.
pub fn compile_funcs(funcs: &[FunctionIndex], tier: Tier, eager_stubs: bool) -> CompiledCode {
    let fill = match tier {
        Tier::Baseline => BASELINE_FILL,
        Tier::Optimized => OPTIMIZED_FILL,
    };
    let mut bytes = Vec::new();
    let mut link_data = LinkData::new();
    let mut metadata = CodeMetadata::default();

    for (i, &func_index) in funcs.iter().enumerate() {
        let begin = bytes.len() as u32;
        bytes.extend(std::iter::repeat_n(fill, FUNC_SIZE as usize));
        let symbol_at = (begin + SYMBOL_OFFSET) as usize;
        bytes[symbol_at..symbol_at + 8].copy_from_slice(&SYMBOLIC_PLACEHOLDER.to_ne_bytes());
        link_data.add_symbolic_link(SymbolicAddress::HandleTrap, begin + SYMBOL_OFFSET);
        if tier == Tier::Optimized {
            link_data.far_jumps.push(FarJump {
                func_index: FunctionIndex::new(0),
                jump_offset: begin + FAR_JUMP_OFFSET,
            });
        }
        metadata.code_ranges.push(CodeRange::new(
            CodeRangeKind::Function {
                func_index,
                unchecked_call_entry: 0,
                tier_entry: TIER_ENTRY,
            },
            begin,
            begin + FUNC_SIZE,
        ));
        metadata.trap_sites.push(TrapSite {
            pc_offset: begin + TRAP_OFFSET,
            trap: TrapCode::Unreachable,
            bytecode_offset: i as u32,
        });
        metadata.func_exports.push(FuncExport {
            func_index,
            code_range_index: CodeRangeIndex::new(i),
            eager_interp_entry_offset: None,
        });
    }

    if eager_stubs {
        for (i, &func_index) in funcs.iter().enumerate() {
            let begin = bytes.len() as u32;
            bytes.extend(std::iter::repeat_n(0u8, STUB_SIZE as usize));
            metadata.code_ranges.push(CodeRange::new(
                CodeRangeKind::InterpEntry { func_index },
                begin,
                begin + STUB_SIZE,
            ));
            metadata.func_exports[i].eager_interp_entry_offset = Some(begin);
        }
    }

    CompiledCode {
        bytes,
        link_data,
        metadata,
    }
}

/// Every defined function of `module`.
pub fn all_funcs(module: &ModuleMetadata) -> Vec<FunctionIndex> {
    module.defined_functions().collect()
}

/// Entry stubs store the address they call in their first eight bytes.
#[derive(Default)]
pub struct FakeGenerator {
    /// Functions of every `compile_entry_stubs` call.
    pub stub_batches: Mutex<Vec<Vec<FunctionIndex>>>,
    /// Make tier-2 compilation fail.
    pub fail_tier2: AtomicBool,
}

impl FakeGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn num_stub_batches(&self) -> usize {
        self.stub_batches.lock().len()
    }
}

impl CodeGenerator for FakeGenerator {
    fn compile_tier2(
        &self,
        module: &ModuleMetadata,
        _cancelled: &AtomicBool,
    ) -> Result<CompiledCode, CompileError> {
        if self.fail_tier2.load(Ordering::SeqCst) {
            return Err(CompileError::Codegen("tier 2 is broken".to_string()));
        }
        Ok(compile_funcs(&all_funcs(module), Tier::Optimized, false))
    }

    fn compile_function(
        &self,
        _module: &ModuleMetadata,
        func_index: FunctionIndex,
        tier: Tier,
        _cancelled: &AtomicBool,
    ) -> Result<CompiledCode, CompileError> {
        Ok(compile_funcs(&[func_index], tier, false))
    }

    fn compile_entry_stubs(
        &self,
        _module: &ModuleMetadata,
        requests: &[EntryStubRequest<'_>],
    ) -> Result<CompiledCode, CompileError> {
        self.stub_batches
            .lock()
            .push(requests.iter().map(|r| r.func_index).collect());

        let mut bytes = Vec::new();
        let mut link_data = LinkData::new();
        let mut metadata = CodeMetadata::default();
        for request in requests {
            let begin = bytes.len() as u32;
            let mut stub = vec![0u8; STUB_SIZE as usize];
            stub[..8].copy_from_slice(&(request.callee as u64).to_ne_bytes());
            stub[8..].copy_from_slice(&SYMBOLIC_PLACEHOLDER.to_ne_bytes());
            bytes.extend(stub);
            link_data.add_symbolic_link(SymbolicAddress::CallImportInterp, begin + 8);
            metadata.code_ranges.push(CodeRange::new(
                CodeRangeKind::InterpEntry {
                    func_index: request.func_index,
                },
                begin,
                begin + STUB_SIZE,
            ));
            if request.with_jit_entry {
                let begin = bytes.len() as u32;
                let mut stub = vec![0u8; STUB_SIZE as usize];
                stub[..8].copy_from_slice(&(request.callee as u64).to_ne_bytes());
                bytes.extend(stub);
                metadata.code_ranges.push(CodeRange::new(
                    CodeRangeKind::JitEntry {
                        func_index: request.func_index,
                    },
                    begin,
                    begin + STUB_SIZE,
                ));
            }
        }
        Ok(CompiledCode {
            bytes,
            link_data,
            metadata,
        })
    }
}

type Task = (String, Box<dyn FnOnce() + Send>);

/// Keeps tasks until the test runs them.
#[derive(Default)]
pub struct QueuedHelpers {
    tasks: Mutex<Vec<Task>>,
}

impl QueuedHelpers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run every queued task on the calling thread.
    pub fn run_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for (_, task) in tasks {
            task();
        }
        count
    }
}

impl HelperThreads for QueuedHelpers {
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send>) -> Result<(), ScheduleError> {
        self.tasks.lock().push((name.to_string(), task));
        Ok(())
    }
}

/// Refuses every task.
pub struct NoHelpers;

impl HelperThreads for NoHelpers {
    fn spawn(&self, name: &str, _task: Box<dyn FnOnce() + Send>) -> Result<(), ScheduleError> {
        Err(ScheduleError {
            task: name.to_string(),
            reason: "no helper threads".to_string(),
        })
    }
}

pub fn runtime_with(
    tunables: CodeTunables,
    helpers: Arc<dyn HelperThreads>,
) -> Arc<ProcessRuntimeState> {
    ProcessRuntimeState::builder(tunables, Arc::new(resolve_symbol))
        .helper_threads(helpers)
        .init()
}

pub fn runtime(helpers: Arc<dyn HelperThreads>) -> Arc<ProcessRuntimeState> {
    runtime_with(CodeTunables::for_host(), helpers)
}
