//! Tunable parameters for code placement.

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Granularity at which executable memory is requested from the OS, and the
/// minimum size of a lazy stub segment.
pub const EXECUTABLE_CODE_PAGE_SIZE: usize = 64 * 1024;

/// Alignment of code allocations when code pages are not write-protected.
///
/// On x86-64, this is 16 since it's what the optimizations assume.
pub const CODE_ALIGNMENT: usize = 16;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "aarch64", target_arch = "arm"))] {
        // Direct branches must be able to reach any code in the process.
        const DEFAULT_MAX_CODE_BYTES_PER_PROCESS: usize = 128 * 1024 * 1024;
    } else if #[cfg(target_pointer_width = "64")] {
        const DEFAULT_MAX_CODE_BYTES_PER_PROCESS: usize = 2 * 1024 * 1024 * 1024;
    } else {
        const DEFAULT_MAX_CODE_BYTES_PER_PROCESS: usize = 140 * 1024 * 1024;
    }
}

/// Tunable parameters for placing WebAssembly code.
///
/// This is the reference set of values used by default. Embedders that
/// need tighter limits can start from [`CodeTunables::for_host`] and
/// override individual fields.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeTunables {
    /// Keep code pages non-writable while executable (W^X). Every code
    /// allocation is then page aligned so toggling protection never
    /// touches a page shared with other code.
    pub write_protect_code: bool,

    /// Hard cap on executable memory mapped by the whole process.
    pub max_code_bytes_per_process: usize,

    /// Minimum capacity of a segment that lazy entry stubs are claimed from.
    pub lazy_stub_segment_size: usize,

    /// Insert a random amount of padding before single-stub allocations to
    /// spread consecutive stubs over icache sets.
    pub randomize_stub_padding: bool,

    /// Generate JIT entry stubs for functions whose signature allows it.
    pub jit_entries: bool,
}

impl CodeTunables {
    /// Get the `CodeTunables` for the host this process runs on.
    pub fn for_host() -> Self {
        Self {
            write_protect_code: true,
            max_code_bytes_per_process: DEFAULT_MAX_CODE_BYTES_PER_PROCESS,
            lazy_stub_segment_size: EXECUTABLE_CODE_PAGE_SIZE,
            randomize_stub_padding: true,
            jit_entries: true,
        }
    }
}

impl Default for CodeTunables {
    fn default() -> Self {
        Self::for_host()
    }
}
