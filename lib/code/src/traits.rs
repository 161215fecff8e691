//! Collaborators the code layer calls out to.
//!
//! The code generator, the helpers generated code links against, profilers
//! and the thread pool all live outside this crate.

use std::sync::atomic::AtomicBool;
use wasmer_code_types::{
    CompileError, CompiledCode, EntryStubRequest, FunctionIndex, ModuleMetadata, ScheduleError,
    SymbolicAddress, Tier,
};

/// Produces machine code for a module.
///
/// All offsets in the returned [`CompiledCode`] start at zero.
pub trait CodeGenerator: Send + Sync {
    /// Compile every defined function of the module with the optimizing
    /// tier. Implementations should poll `cancelled` between functions and
    /// give up early once it is set.
    fn compile_tier2(
        &self,
        module: &ModuleMetadata,
        cancelled: &AtomicBool,
    ) -> Result<CompiledCode, CompileError>;

    /// Compile a single function at `tier`.
    fn compile_function(
        &self,
        module: &ModuleMetadata,
        func_index: FunctionIndex,
        tier: Tier,
        cancelled: &AtomicBool,
    ) -> Result<CompiledCode, CompileError>;

    /// Generate entry stubs for a batch of functions.
    ///
    /// For every request, in order, the output must contain an interpreter
    /// entry range followed by a JIT entry range when
    /// `with_jit_entry` is set.
    fn compile_entry_stubs(
        &self,
        module: &ModuleMetadata,
        requests: &[EntryStubRequest<'_>],
    ) -> Result<CompiledCode, CompileError>;
}

/// Resolves runtime helpers to their address in this process.
pub trait SymbolicAddressResolver: Send + Sync {
    /// The absolute address of `symbol`.
    fn resolve(&self, symbol: SymbolicAddress) -> usize;
}

impl<F> SymbolicAddressResolver for F
where
    F: Fn(SymbolicAddress) -> usize + Send + Sync,
{
    fn resolve(&self, symbol: SymbolicAddress) -> usize {
        self(symbol)
    }
}

/// Receives the location of every function range once its code is
/// published, for instance to write a perf map.
pub trait CodeProfiler: Send + Sync {
    /// `[start, start + len)` now holds code for `name`.
    fn register_code_range(&self, name: &str, start: usize, len: usize);
}

/// Runs background compilation tasks.
pub trait HelperThreads: Send + Sync {
    /// Run `task` off the calling thread.
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send>) -> Result<(), ScheduleError>;
}

/// Spawns one low-priority OS thread per task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl HelperThreads for ThreadSpawner {
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send>) -> Result<(), ScheduleError> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Min)
                    .ok();
                task();
            })
            .map(|_| ())
            .map_err(|e| ScheduleError {
                task: name.to_string(),
                reason: e.to_string(),
            })
    }
}
