//! Contiguous executable allocations that code blocks live in.

use crate::link::{statically_link, FarJumpResolver};
use crate::runtime::CodeId;
use crate::traits::SymbolicAddressResolver;
use more_asserts::{assert_le, debug_assert_le};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wasmer_code_types::{CodeMemoryError, CompileError, LinkData, CODE_ALIGNMENT};
use wasmer_code_vm::{
    os_page_size, round_down_to_page_size, round_up_to_page_size, ExecutableAllocator,
    ExecutableMemory, LastDitch, WritableRange,
};

/// A page-aligned region of executable memory, sub-allocated with a bump
/// pointer.
///
/// Segments are shared: a tier segment by its one block, a lazy stub
/// segment by every stub block claimed from it. The memory is unmapped when
/// the last holder goes away.
pub struct CodeSegment {
    memory: ExecutableMemory,
    length: AtomicUsize,
    owner: AtomicUsize,
    write_protect: bool,
}

impl fmt::Debug for CodeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeSegment")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("length", &self.length())
            .field("capacity", &self.capacity())
            .field("owner", &self.owner())
            .finish()
    }
}

impl CodeSegment {
    /// Allocate an empty segment of at least `capacity` bytes.
    pub fn create_empty(
        allocator: &ExecutableAllocator,
        capacity: usize,
    ) -> Result<Arc<Self>, CodeMemoryError> {
        let memory = allocator.allocate(capacity, LastDitch::Allow)?;
        Ok(Arc::new(Self {
            memory,
            length: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            write_protect: allocator.write_protect(),
        }))
    }

    /// Allocate a segment holding exactly `bytes`, linked and executable.
    pub fn create_from_bytes(
        allocator: &ExecutableAllocator,
        bytes: &[u8],
        link_data: &LinkData,
        symbols: &dyn SymbolicAddressResolver,
        far_jumps: Option<FarJumpResolver<'_>>,
    ) -> Result<Arc<Self>, CompileError> {
        let segment = Self::create_empty(allocator, bytes.len())?;
        let allocation_length = segment.align_allocation_bytes(bytes.len());
        let offset = segment.claim_space(allocation_length);
        debug_assert_eq!(offset, 0);
        // The segment is not shared with anyone yet.
        let mut writable = unsafe { segment.writable(0, allocation_length) }?;
        writable.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        segment.link_and_make_executable_sub_range(
            writable,
            link_data,
            0,
            bytes.len(),
            symbols,
            far_jumps,
        )?;
        Ok(segment)
    }

    /// Base address.
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    /// Total bytes available.
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes claimed so far.
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    /// Whether `addr` lies inside the segment.
    pub fn contains(&self, addr: usize) -> bool {
        self.memory.contains(addr)
    }

    /// Whether `bytes` more bytes can be claimed.
    pub fn has_space(&self, bytes: usize) -> bool {
        bytes <= self.capacity() - self.length()
    }

    /// Claim `bytes` bytes and return the offset of the first one.
    ///
    /// The segment does not serialize claims. Callers claiming from the
    /// same segment must hold a common lock, and must have checked
    /// [`CodeSegment::has_space`] under it.
    pub fn claim_space(&self, bytes: usize) -> usize {
        let offset = self.length();
        assert_le!(bytes, self.capacity() - offset, "segment is out of space");
        self.length.store(offset + bytes, Ordering::Release);
        offset
    }

    /// Round `bytes` up to the granularity claims are made at: whole OS
    /// pages when code is write-protected, so that changing the protection
    /// of one claim never touches another.
    pub fn align_allocation_bytes(&self, bytes: usize) -> usize {
        if self.write_protect {
            round_up_to_page_size(bytes, os_page_size())
        } else {
            round_up_to_page_size(bytes, CODE_ALIGNMENT)
        }
    }

    /// Random padding to put in front of a single stub of `code_length`
    /// bytes, spreading consecutive stubs over instruction cache sets.
    ///
    /// The padding is a multiple of [`CODE_ALIGNMENT`], at most three
    /// quarters of a page, and only uses the slack of the last page, so the
    /// aligned allocation spans as many pages as without it. Without write
    /// protection claims are not page aligned and there is no slack to use.
    pub fn random_stub_padding(&self, code_length: usize) -> usize {
        if !self.write_protect {
            return 0;
        }
        let page_size = os_page_size();
        let slack = self.align_allocation_bytes(code_length) - code_length;
        let max_padding = round_down_to_page_size(
            usize::min(slack, page_size / 4 * 3),
            CODE_ALIGNMENT,
        );
        if max_padding == 0 {
            return 0;
        }
        let padding = rand::rng().random_range(0..=max_padding / CODE_ALIGNMENT) * CODE_ALIGNMENT;
        debug_assert_eq!(
            self.align_allocation_bytes(code_length + padding),
            self.align_allocation_bytes(code_length)
        );
        padding
    }

    /// Open `[offset, offset + len)` for writing.
    ///
    /// # Safety
    ///
    /// The range must have been claimed by the caller and not be published
    /// yet.
    pub unsafe fn writable(
        &self,
        offset: usize,
        len: usize,
    ) -> Result<WritableRange<'_>, CodeMemoryError> {
        debug_assert_le!(offset + len, self.length());
        unsafe { self.memory.writable(offset, len) }
    }

    /// Published bytes at `[offset, offset + len)`.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        // Published code is never written again.
        unsafe { self.memory.bytes(offset, len) }
    }

    /// Link the code at `[code_start, code_start + code_length)` and make
    /// the whole of `writable` executable, including any padding in front
    /// of the code.
    pub fn link_and_make_executable_sub_range(
        &self,
        mut writable: WritableRange<'_>,
        link_data: &LinkData,
        code_start: usize,
        code_length: usize,
        symbols: &dyn SymbolicAddressResolver,
        far_jumps: Option<FarJumpResolver<'_>>,
    ) -> Result<(), CodeMemoryError> {
        let allocation_start = writable.offset();
        assert_le!(allocation_start, code_start);
        assert_le!(
            code_start + code_length,
            allocation_start + writable.len()
        );
        let begin = code_start - allocation_start;
        let code = &mut writable.as_mut_slice()[begin..begin + code_length];
        statically_link(code, self.base() + code_start, link_data, symbols, far_jumps);
        writable.make_executable()
    }

    /// The `Code` this segment belongs to.
    pub fn owner(&self) -> Option<CodeId> {
        CodeId::from_usize(self.owner.load(Ordering::Acquire))
    }

    /// Record which `Code` the segment belongs to. A segment never changes
    /// owner.
    pub(crate) fn set_owner(&self, code: CodeId) {
        let result = self.owner.compare_exchange(
            0,
            code.as_usize(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(current) = result {
            assert_eq!(
                current,
                code.as_usize(),
                "segment at {:#x} is already owned by another code",
                self.base()
            );
        }
    }
}
