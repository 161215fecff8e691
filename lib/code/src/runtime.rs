//! State shared by every module of the process.
//!
//! Any thread, including a signal handler or a sampling profiler, must be
//! able to map a program counter to the code block containing it without
//! knowing which module it belongs to. The map that allows this, the code
//! memory budget and the host collaborators live in one
//! [`ProcessRuntimeState`], created by [`ProcessRuntimeBuilder::init`] and
//! torn down by [`ProcessRuntimeState::shutdown`].

use crate::block::CodeBlock;
use crate::traits::{CodeProfiler, HelperThreads, SymbolicAddressResolver, ThreadSpawner};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use wasmer_code_types::{CodeRange, CodeTunables, CompileError, TrapSite};
use wasmer_code_vm::{CodeMap, ExecutableAllocator};

/// Identifies a `Code` within the process. Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(usize);

impl CodeId {
    /// The raw value. Zero is never handed out.
    pub fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn from_usize(raw: usize) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code{}", self.0)
    }
}

/// Configures a [`ProcessRuntimeState`].
pub struct ProcessRuntimeBuilder {
    tunables: CodeTunables,
    symbols: Arc<dyn SymbolicAddressResolver>,
    profiler: Option<Arc<dyn CodeProfiler>>,
    helper_threads: Arc<dyn HelperThreads>,
    last_ditch: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ProcessRuntimeBuilder {
    /// Report published code ranges to `profiler`.
    pub fn profiler(mut self, profiler: Arc<dyn CodeProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Run background compilation on `helper_threads` instead of spawning
    /// a thread per task.
    pub fn helper_threads(mut self, helper_threads: Arc<dyn HelperThreads>) -> Self {
        self.helper_threads = helper_threads;
        self
    }

    /// Run `callback` when code memory runs out, before retrying once.
    pub fn last_ditch(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.last_ditch = Some(Box::new(callback));
        self
    }

    /// Create the state.
    pub fn init(self) -> Arc<ProcessRuntimeState> {
        let allocator = ExecutableAllocator::new(
            self.tunables.max_code_bytes_per_process,
            self.tunables.write_protect_code,
        );
        if let Some(callback) = self.last_ditch {
            allocator.set_last_ditch_callback(callback);
        }
        tracing::debug!(
            max_code_bytes = self.tunables.max_code_bytes_per_process,
            write_protect = self.tunables.write_protect_code,
            "process runtime initialized"
        );
        Arc::new(ProcessRuntimeState {
            code_map: AtomicPtr::new(Box::into_raw(Box::new(CodeMap::new()))),
            users: AtomicUsize::new(0),
            next_code_id: AtomicUsize::new(1),
            allocator,
            tunables: self.tunables,
            symbols: self.symbols,
            profiler: self.profiler,
            helper_threads: self.helper_threads,
        })
    }
}

/// Process-wide code management state.
pub struct ProcessRuntimeState {
    /// Null once shut down.
    code_map: AtomicPtr<CodeMap<CodeBlock>>,
    /// Threads currently using `code_map`.
    users: AtomicUsize,
    next_code_id: AtomicUsize,
    allocator: ExecutableAllocator,
    tunables: CodeTunables,
    symbols: Arc<dyn SymbolicAddressResolver>,
    profiler: Option<Arc<dyn CodeProfiler>>,
    helper_threads: Arc<dyn HelperThreads>,
}

impl fmt::Debug for ProcessRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRuntimeState")
            .field("allocator", &self.allocator)
            .field("tunables", &self.tunables)
            .field("is_shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Releases the use of the code map taken by [`ProcessRuntimeState::with_map`].
struct UserGuard<'a>(&'a AtomicUsize);

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProcessRuntimeState {
    /// Start configuring a runtime.
    pub fn builder(
        tunables: CodeTunables,
        symbols: Arc<dyn SymbolicAddressResolver>,
    ) -> ProcessRuntimeBuilder {
        ProcessRuntimeBuilder {
            tunables,
            symbols,
            profiler: None,
            helper_threads: Arc::new(ThreadSpawner),
            last_ditch: None,
        }
    }

    /// The code memory allocator.
    pub fn allocator(&self) -> &ExecutableAllocator {
        &self.allocator
    }

    /// Code placement tunables.
    pub fn tunables(&self) -> &CodeTunables {
        &self.tunables
    }

    /// Resolver for runtime helpers.
    pub fn symbols(&self) -> &dyn SymbolicAddressResolver {
        &*self.symbols
    }

    /// The profiler hook, if any.
    pub fn profiler(&self) -> Option<&dyn CodeProfiler> {
        self.profiler.as_deref()
    }

    /// Where background compilation runs.
    pub fn helper_threads(&self) -> &dyn HelperThreads {
        &*self.helper_threads
    }

    pub(crate) fn next_code_id(&self) -> CodeId {
        CodeId(self.next_code_id.fetch_add(1, Ordering::Relaxed))
    }

    fn with_map<R>(&self, f: impl FnOnce(&CodeMap<CodeBlock>) -> R) -> Option<R> {
        self.users.fetch_add(1, Ordering::SeqCst);
        let _guard = UserGuard(&self.users);
        let map = self.code_map.load(Ordering::SeqCst);
        // Freed only after `users` drained, and we are counted.
        unsafe { map.as_ref() }.map(f)
    }

    /// Make `block` visible to PC lookups.
    pub(crate) fn register_code_block(&self, block: &CodeBlock) -> Result<(), CompileError> {
        let (start, end) = block.code_bounds();
        self.with_map(|map| unsafe {
            // The block unregisters itself before it is freed.
            map.insert(start, end, NonNull::from(block))
        })
        .ok_or_else(|| CompileError::Resource("the process runtime is shut down".to_string()))
    }

    pub(crate) fn unregister_code_block(&self, block: &CodeBlock) {
        let (start, _) = block.code_bounds();
        // After shutdown the map and its entries are gone already.
        self.with_map(|map| map.remove(start, NonNull::from(block)));
    }

    /// Run `f` on the code block containing `pc`.
    ///
    /// Never blocks, so it may be called from a signal handler. The block
    /// cannot be destroyed while `f` runs: a `Code` dropped by `f` keeps its
    /// blocks registered until the lookup returns. `f` must not create code,
    /// drop a block it holds on its own, or shut the runtime down.
    pub fn lookup_code_block<R>(&self, pc: usize, f: impl FnOnce(&CodeBlock) -> R) -> Option<R> {
        self.with_map(|map| map.lookup(pc, f)).flatten()
    }

    /// Whether `pc` is inside registered code.
    pub fn is_wasm_code(&self, pc: usize) -> bool {
        self.lookup_code_block(pc, |_| ()).is_some()
    }

    /// The code range containing `pc`.
    pub fn lookup_code_range(&self, pc: usize) -> Option<CodeRange> {
        self.lookup_code_block(pc, |block| block.lookup_range(pc).copied())
            .flatten()
    }

    /// The trap raised by the instruction at `pc`, if it is a trap site.
    pub fn lookup_trap(&self, pc: usize) -> Option<TrapSite> {
        self.lookup_code_block(pc, |block| block.lookup_trap(pc).copied())
            .flatten()
    }

    /// Number of registered code blocks.
    pub fn num_registered_blocks(&self) -> usize {
        self.with_map(|map| map.len()).unwrap_or(0)
    }

    /// Whether [`ProcessRuntimeState::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.code_map.load(Ordering::SeqCst).is_null()
    }

    /// Tear down the code map.
    ///
    /// New registrations fail and lookups find nothing from now on. Lookups
    /// already in flight are waited for before the map is freed.
    pub fn shutdown(&self) {
        let map = self.code_map.swap(ptr::null_mut(), Ordering::SeqCst);
        if map.is_null() {
            return;
        }
        while self.users.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        let map = unsafe { Box::from_raw(map) };
        tracing::debug!(
            remaining_blocks = map.len(),
            "process runtime shut down"
        );
    }
}

impl Drop for ProcessRuntimeState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static PROCESS_RUNTIME: OnceLock<Arc<ProcessRuntimeState>> = OnceLock::new();

/// Install `state` as the runtime of this process. Fails, returning the
/// state, if one was installed already.
pub fn install_global(state: Arc<ProcessRuntimeState>) -> Result<(), Arc<ProcessRuntimeState>> {
    PROCESS_RUNTIME.set(state)
}

/// The runtime installed with [`install_global`].
pub fn process_global() -> Option<&'static Arc<ProcessRuntimeState>> {
    PROCESS_RUNTIME.get()
}
