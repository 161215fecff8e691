// This file contains code from external sources.
// Attributions: https://github.com/wasmerio/wasmer/blob/main/docs/ATTRIBUTIONS.md

//! Low-level allocation of executable memory.
//!
//! Memory handed out by [`ExecutableAllocator`] is mapped writable first. A
//! [`WritableRange`] guard gives mutable access to part of it and flips that
//! part to executable once the caller is done patching.

use crate::cache::flush_icache;
use more_asserts::{assert_le, debug_assert_le};
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wasmer_code_types::{CodeMemoryError, EXECUTABLE_CODE_PAGE_SIZE};

/// Round `size` up to the nearest multiple of `page_size`.
pub fn round_up_to_page_size(size: usize, page_size: usize) -> usize {
    (size + (page_size - 1)) & !(page_size - 1)
}

/// Round `size` down to the nearest multiple of `page_size`.
pub fn round_down_to_page_size(size: usize, page_size: usize) -> usize {
    size & !(page_size - 1)
}

/// Size of an OS page.
pub fn os_page_size() -> usize {
    region::page::size()
}

/// Granularity of executable allocations: a multiple of the OS page size.
pub fn allocation_granularity() -> usize {
    usize::max(EXECUTABLE_CODE_PAGE_SIZE, os_page_size())
}

/// Whether an allocation that failed may be retried after running the
/// last-ditch reclamation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastDitch {
    /// Run the callback and retry once.
    Allow,
    /// Give up on the first failure.
    Forbid,
}

type LastDitchCallback = Box<dyn Fn() + Send + Sync>;

struct AllocatorInner {
    max_code_bytes: usize,
    write_protect: bool,
    allocated: AtomicUsize,
    last_ditch: RwLock<Option<LastDitchCallback>>,
}

impl AllocatorInner {
    /// Account for `size` bytes against the budget.
    fn reserve(&self, size: usize) -> Result<(), CodeMemoryError> {
        let mut allocated = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = allocated
                .checked_add(size)
                .filter(|next| *next <= self.max_code_bytes)
                .ok_or(CodeMemoryError::BudgetExceeded {
                    requested: size,
                    allocated,
                    max: self.max_code_bytes,
                })?;
            match self.allocated.compare_exchange_weak(
                allocated,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => allocated = current,
            }
        }
    }

    fn release(&self, size: usize) {
        let prev = self.allocated.fetch_sub(size, Ordering::Relaxed);
        debug_assert_le!(size, prev);
    }

    fn try_allocate(&self, size: usize) -> Result<usize, CodeMemoryError> {
        self.reserve(size)?;
        match map_pages(size, self.write_protect) {
            Ok(ptr) => Ok(ptr),
            Err(e) => {
                self.release(size);
                Err(e)
            }
        }
    }
}

/// Hands out page-aligned executable memory and enforces the process-wide
/// code budget.
///
/// Clones share the budget.
#[derive(Clone)]
pub struct ExecutableAllocator {
    inner: Arc<AllocatorInner>,
}

impl fmt::Debug for ExecutableAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableAllocator")
            .field("max_code_bytes", &self.inner.max_code_bytes)
            .field("write_protect", &self.inner.write_protect)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

impl ExecutableAllocator {
    /// Create an allocator limited to `max_code_bytes` of mapped code.
    ///
    /// With `write_protect`, memory is never writable and executable at the
    /// same time.
    pub fn new(max_code_bytes: usize, write_protect: bool) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                max_code_bytes,
                write_protect,
                allocated: AtomicUsize::new(0),
                last_ditch: RwLock::new(None),
            }),
        }
    }

    /// Install the callback run before retrying a failed allocation. It is
    /// expected to release unused code, for instance by collecting dead
    /// modules.
    pub fn set_last_ditch_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.last_ditch.write() = Some(Box::new(callback));
    }

    /// Whether code pages are kept W^X.
    pub fn write_protect(&self) -> bool {
        self.inner.write_protect
    }

    /// Bytes currently mapped through this allocator.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// The process code budget.
    pub fn max_code_bytes(&self) -> usize {
        self.inner.max_code_bytes
    }

    /// Allocate at least `length` bytes of code memory.
    ///
    /// The length is rounded up to [`allocation_granularity`] and the bytes
    /// past `length` are zeroed. The memory starts out writable.
    pub fn allocate(
        &self,
        length: usize,
        last_ditch: LastDitch,
    ) -> Result<ExecutableMemory, CodeMemoryError> {
        let rounded = round_up_to_page_size(length.max(1), allocation_granularity());
        if rounded > self.inner.max_code_bytes {
            return Err(CodeMemoryError::BudgetExceeded {
                requested: rounded,
                allocated: self.allocated_bytes(),
                max: self.inner.max_code_bytes,
            });
        }

        let ptr = match self.inner.try_allocate(rounded) {
            Ok(ptr) => ptr,
            Err(e) if last_ditch == LastDitch::Allow => {
                tracing::warn!(
                    requested = rounded,
                    allocated = self.allocated_bytes(),
                    "code allocation failed, running last-ditch reclamation: {e}"
                );
                if let Some(callback) = self.inner.last_ditch.read().as_ref() {
                    callback();
                }
                self.inner.try_allocate(rounded)?
            }
            Err(e) => return Err(e),
        };

        // Fresh anonymous pages are zero already, but the padding must not
        // depend on that.
        unsafe {
            ptr::write_bytes((ptr as *mut u8).add(length), 0, rounded - length);
        }

        tracing::trace!(ptr = ptr, length, rounded, "allocated code memory");
        Ok(ExecutableMemory {
            ptr,
            len: rounded,
            allocator: self.inner.clone(),
        })
    }
}

#[cfg(not(target_os = "windows"))]
fn map_pages(size: usize, write_protect: bool) -> Result<usize, CodeMemoryError> {
    let prot = if write_protect {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
    };
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr as isize == -1_isize {
        return Err(CodeMemoryError::Region(
            io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as usize)
}

#[cfg(not(target_os = "windows"))]
fn unmap_pages(ptr: usize, size: usize) {
    let r = unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
    assert_eq!(r, 0, "munmap failed: {}", io::Error::last_os_error());
}

#[cfg(target_os = "windows")]
fn map_pages(size: usize, write_protect: bool) -> Result<usize, CodeMemoryError> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE, VirtualAlloc,
    };
    let prot = if write_protect {
        PAGE_READWRITE
    } else {
        PAGE_EXECUTE_READWRITE
    };
    let ptr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, prot) };
    if ptr.is_null() {
        return Err(CodeMemoryError::Region(
            io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as usize)
}

#[cfg(target_os = "windows")]
fn unmap_pages(ptr: usize, _size: usize) {
    use std::ffi::c_void;
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};
    let r = unsafe { VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE) };
    assert_ne!(r, 0);
}

/// A page-aligned mapping of code memory. Unmapped on drop, which also
/// returns its rounded length to the budget.
pub struct ExecutableMemory {
    // Stored as a `usize` so the type is `Send` and `Sync` without an
    // `unsafe impl`; access to the bytes is coordinated by the owners.
    ptr: usize,
    len: usize,
    allocator: Arc<AllocatorInner>,
}

impl fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .finish()
    }
}

impl ExecutableMemory {
    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Rounded length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Mappings are never empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies inside the mapping.
    pub fn contains(&self, addr: usize) -> bool {
        self.ptr <= addr && addr < self.ptr + self.len
    }

    /// Read `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// No [`WritableRange`] may be live over the bytes read.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert_le!(offset + len, self.len);
        unsafe { slice::from_raw_parts(self.as_ptr().add(offset), len) }
    }

    /// Open `[offset, offset + len)` for writing.
    ///
    /// With write protection the pages covering the range are switched to
    /// read-write. They go back to read-execute when the guard is consumed
    /// by [`WritableRange::make_executable`] or dropped.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the pages covering the
    /// range: no other thread may write them or execute them until the
    /// guard is gone.
    pub unsafe fn writable(
        &self,
        offset: usize,
        len: usize,
    ) -> Result<WritableRange<'_>, CodeMemoryError> {
        assert_le!(offset + len, self.len);
        let range = WritableRange {
            memory: self,
            offset,
            len,
            finished: false,
        };
        if self.allocator.write_protect && len != 0 {
            range.protect(region::Protection::READ_WRITE)?;
        }
        Ok(range)
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unmap_pages(self.ptr, self.len);
        self.allocator.release(self.len);
        tracing::trace!(ptr = self.ptr, len = self.len, "released code memory");
    }
}

/// Mutable access to part of an [`ExecutableMemory`].
pub struct WritableRange<'a> {
    memory: &'a ExecutableMemory,
    offset: usize,
    len: usize,
    finished: bool,
}

impl WritableRange<'_> {
    /// Offset of the range inside its mapping.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte of the range.
    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.memory.as_ptr().add(self.offset) }
    }

    /// The bytes of the range.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_ptr() as *mut u8, self.len) }
    }

    fn protect(&self, protection: region::Protection) -> Result<(), CodeMemoryError> {
        let page_size = os_page_size();
        let base = self.memory.ptr + self.offset;
        let start = round_down_to_page_size(base, page_size);
        let end = round_up_to_page_size(base + self.len, page_size);
        unsafe { region::protect(start as *const u8, end - start, protection) }
            .map_err(|e| CodeMemoryError::Protect(e.to_string()))
    }

    /// Make the range executable and flush it from the instruction cache.
    pub fn make_executable(mut self) -> Result<(), CodeMemoryError> {
        self.finished = true;
        if self.len == 0 {
            return Ok(());
        }
        if self.memory.allocator.write_protect {
            self.protect(region::Protection::READ_EXECUTE)?;
        }
        flush_icache(self.as_ptr(), self.len);
        Ok(())
    }
}

impl Drop for WritableRange<'_> {
    fn drop(&mut self) {
        if self.finished || self.len == 0 || !self.memory.allocator.write_protect {
            return;
        }
        if let Err(e) = self.protect(region::Protection::READ_EXECUTE) {
            tracing::error!(
                offset = self.offset,
                len = self.len,
                "failed to restore code protection: {e}"
            );
        }
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<ExecutableMemory>();
    _assert_send_sync::<ExecutableAllocator>();
}
