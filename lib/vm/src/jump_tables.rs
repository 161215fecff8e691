//! Per-module tables of raw function entry points.
//!
//! Running code reads these tables without synchronization. Every slot is a
//! single pointer-sized atomic, so a reader sees either the old or the new
//! entry, never a mix of both.

use more_asserts::assert_lt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{CompileMode, FunctionIndex};

/// The tiering and JIT entry tables of one module.
#[derive(Debug)]
pub struct JumpTables {
    mode: CompileMode,
    /// Where baseline code jumps to switch tiers. Only meaningful while the
    /// module is tiering; imported functions stay null.
    tiering: Box<[AtomicPtr<u8>]>,
    /// Entries used by JIT callers that bypass the interpreter. Functions
    /// that were never exported stay null.
    jit: Box<[AtomicPtr<u8>]>,
    tiering_complete: AtomicBool,
}

fn null_slots(len: usize) -> Box<[AtomicPtr<u8>]> {
    (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect()
}

impl JumpTables {
    /// Create tables for `num_funcs` functions, every slot null.
    pub fn new(mode: CompileMode, num_funcs: usize) -> Self {
        let tiering_len = if mode.is_tiering() { num_funcs } else { 0 };
        Self {
            mode,
            tiering: null_slots(tiering_len),
            jit: null_slots(num_funcs),
            tiering_complete: AtomicBool::new(false),
        }
    }

    /// Number of functions covered.
    pub fn num_funcs(&self) -> usize {
        self.jit.len()
    }

    /// The compile mode the tables were created for.
    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    /// Store the JIT entry of `func_index`. Last writer wins.
    pub fn set_jit_entry(&self, func_index: FunctionIndex, target: *const u8) {
        self.jit_slot(func_index)
            .store(target as *mut u8, Ordering::Release);
    }

    /// Store the JIT entry of `func_index` unless one was already stored.
    /// Returns whether the store happened.
    pub fn set_jit_entry_if_null(&self, func_index: FunctionIndex, target: *const u8) -> bool {
        self.jit_slot(func_index)
            .compare_exchange(
                ptr::null_mut(),
                target as *mut u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The JIT entry of `func_index`, null if none was published.
    pub fn jit_entry(&self, func_index: FunctionIndex) -> *const u8 {
        self.jit_slot(func_index).load(Ordering::Acquire)
    }

    /// Address of the JIT entry slot of `func_index`, for callers that
    /// embed it and later recover the index with
    /// [`JumpTables::func_index_from_jit_entry`].
    pub fn jit_entry_slot(&self, func_index: FunctionIndex) -> *const AtomicPtr<u8> {
        self.jit_slot(func_index)
    }

    /// Recover the function index from the address of a JIT entry slot.
    ///
    /// Panics if `slot` does not point into the JIT table.
    pub fn func_index_from_jit_entry(&self, slot: *const AtomicPtr<u8>) -> FunctionIndex {
        let base = self.jit.as_ptr() as usize;
        let addr = slot as usize;
        let size = std::mem::size_of::<AtomicPtr<u8>>();
        assert!(
            addr >= base && (addr - base) % size == 0,
            "{addr:#x} is not a jit entry slot"
        );
        let index = (addr - base) / size;
        assert_lt!(index, self.jit.len());
        FunctionIndex::new(index)
    }

    /// Store the tiering entry of `func_index`.
    ///
    /// Does nothing unless the module is tiering and tiering has not
    /// finished yet.
    pub fn set_tiering_entry(&self, func_index: FunctionIndex, target: *const u8) {
        if !self.mode.is_tiering() || self.tiering_complete.load(Ordering::Acquire) {
            return;
        }
        self.tiering[func_index.index()].store(target as *mut u8, Ordering::Release);
    }

    /// The tiering entry of `func_index`, null if unset or not tiering.
    pub fn tiering_entry(&self, func_index: FunctionIndex) -> *const u8 {
        self.tiering
            .get(func_index.index())
            .map_or(ptr::null(), |slot| slot.load(Ordering::Acquire))
    }

    /// Base address of the tiering table, null when the module does not
    /// tier.
    pub fn tiering_table(&self) -> *const AtomicPtr<u8> {
        if self.tiering.is_empty() {
            ptr::null()
        } else {
            self.tiering.as_ptr()
        }
    }

    /// Mark tiering as finished. Later tiering stores are ignored.
    pub fn finish_tiering(&self) {
        self.tiering_complete.store(true, Ordering::Release);
    }

    /// Whether [`JumpTables::finish_tiering`] was called.
    pub fn is_tiering_complete(&self) -> bool {
        self.tiering_complete.load(Ordering::Acquire)
    }

    fn jit_slot(&self, func_index: FunctionIndex) -> &AtomicPtr<u8> {
        &self.jit[func_index.index()]
    }
}
