//! Instruction cache maintenance after code has been written.

use std::sync::atomic::{fence, Ordering};

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        /// Invalidate the instruction cache for `[ptr, ptr + len)`.
        pub fn flush_icache(ptr: *const u8, len: usize) {
            use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
            use windows_sys::Win32::System::Threading::GetCurrentProcess;
            unsafe {
                FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len);
            }
        }
    } else if #[cfg(any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64"))] {
        unsafe extern "C" {
            fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
        }

        /// Invalidate the instruction cache for `[ptr, ptr + len)`.
        pub fn flush_icache(ptr: *const u8, len: usize) {
            if len == 0 {
                return;
            }
            unsafe {
                __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
            }
        }
    } else {
        /// Invalidate the instruction cache for `[ptr, ptr + len)`.
        ///
        /// x86 keeps instruction and data caches coherent.
        pub fn flush_icache(_ptr: *const u8, _len: usize) {}
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")
))]
mod membarrier {
    use std::sync::OnceLock;

    const MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 1 << 5;
    const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 1 << 6;

    fn registered() -> bool {
        static REGISTERED: OnceLock<bool> = OnceLock::new();
        *REGISTERED.get_or_init(|| {
            let r = unsafe {
                libc::syscall(
                    libc::SYS_membarrier,
                    MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE,
                    0,
                )
            };
            if r != 0 {
                tracing::debug!(
                    "membarrier sync-core is unavailable: {}",
                    std::io::Error::last_os_error()
                );
            }
            r == 0
        })
    }

    /// Returns whether the barrier was issued.
    pub(super) fn sync_core() -> bool {
        if !registered() {
            return false;
        }
        let r = unsafe {
            libc::syscall(
                libc::SYS_membarrier,
                MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE,
                0,
            )
        };
        r == 0
    }
}

/// Make sure every thread of the process refetches instructions before it
/// can observe stores made after this call.
///
/// Flushing the icache only covers the data path. On weakly ordered
/// architectures another core may still have stale instructions in its
/// pipeline, which a sync-core membarrier discards.
pub fn flush_execution_context_for_all_threads() {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")
    ))]
    if !membarrier::sync_core() {
        tracing::warn!("could not serialize instruction streams of other threads");
    }
    fence(Ordering::SeqCst);
}
