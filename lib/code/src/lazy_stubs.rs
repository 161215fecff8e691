//! Entry stubs generated the first time a function is entered from the
//! host.
//!
//! Generating interpreter and JIT entries for every export up front is
//! wasted work for modules that only ever call a handful of them. Instead,
//! stubs are generated on demand, in batches when possible, into segments
//! pooled by the owning `Code`.

use crate::block::{CodeBlock, CodeBlockKind};
use crate::code::{Code, CodeData};
use crate::segment::CodeSegment;
use more_asserts::assert_le;
use std::sync::Arc;
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{
    CodeBlockIndex, CodeMemoryError, CodeRange, CodeRangeIndex, CodeRangeKind, CompileError,
    EntryStubRequest, FunctionIndex, Tier,
};
use wasmer_code_vm::ExecutableAllocator;

/// Where the lazily generated entry stubs of a function live.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LazyFuncExport {
    /// The function.
    pub func_index: FunctionIndex,
    /// Tier of the code the stubs call into.
    pub tier: Tier,
    /// Block holding the stubs.
    pub block_index: CodeBlockIndex,
    /// The interpreter entry range in that block. The JIT entry, if any,
    /// is the range right after it.
    pub func_code_range_index: CodeRangeIndex,
}

struct StubAllocation {
    segment: Arc<CodeSegment>,
    allocation_start: usize,
    code_start: usize,
    allocation_length: usize,
}

/// Lazily generated entry stubs of one `Code`.
#[derive(Debug, Default)]
pub(crate) struct LazyStubTier {
    /// Sorted by function index.
    exports: Vec<LazyFuncExport>,
    segments: Vec<Arc<CodeSegment>>,
}

impl LazyStubTier {
    pub(crate) fn lookup(&self, func_index: FunctionIndex) -> Option<&LazyFuncExport> {
        self.exports
            .binary_search_by_key(&func_index, |export| export.func_index)
            .ok()
            .map(|idx| &self.exports[idx])
    }

    pub(crate) fn exports(&self) -> &[LazyFuncExport] {
        &self.exports
    }

    /// Record new stubs for a function. Stubs calling into a better tier
    /// replace older ones, never the other way round.
    fn merge(&mut self, export: LazyFuncExport) {
        match self
            .exports
            .binary_search_by_key(&export.func_index, |e| e.func_index)
        {
            Ok(idx) => {
                if self.exports[idx].tier <= export.tier {
                    self.exports[idx] = export;
                }
            }
            Err(idx) => self.exports.insert(idx, export),
        }
    }

    /// Claim room for `code_length` bytes of stubs, with random padding in
    /// front when `pad` is set.
    fn claim(
        &mut self,
        allocator: &ExecutableAllocator,
        min_segment_size: usize,
        code_length: usize,
        pad: bool,
    ) -> Result<StubAllocation, CodeMemoryError> {
        let reuse = self.segments.last().cloned();
        let segment = match reuse {
            Some(segment) if segment.has_space(segment.align_allocation_bytes(code_length)) => {
                segment
            }
            _ => {
                let segment =
                    CodeSegment::create_empty(allocator, usize::max(min_segment_size, code_length))?;
                tracing::trace!(
                    base = segment.base(),
                    capacity = segment.capacity(),
                    "new lazy stub segment"
                );
                self.segments.push(segment.clone());
                segment
            }
        };
        let padding = if pad {
            segment.random_stub_padding(code_length)
        } else {
            0
        };
        let allocation_length = segment.align_allocation_bytes(padding + code_length);
        let allocation_start = segment.claim_space(allocation_length);
        Ok(StubAllocation {
            segment,
            allocation_start,
            code_start: allocation_start + padding,
            allocation_length,
        })
    }
}

/// Check that the generator emitted an interpreter entry and, when asked
/// for, a JIT entry for each request, in request order.
fn check_stub_ranges(requests: &[EntryStubRequest<'_>], ranges: &[CodeRange]) {
    let expected: usize = requests
        .iter()
        .map(|request| 1 + request.with_jit_entry as usize)
        .sum();
    assert_eq!(ranges.len(), expected, "unexpected number of stub ranges");

    let mut ranges = ranges.iter();
    let mut end = 0;
    let mut next = |expected: CodeRangeKind| {
        let range = ranges.next().expect("counted above");
        assert_eq!(range.kind(), expected, "stub ranges out of order");
        assert_le!(end, range.begin(), "stub ranges out of order");
        end = range.end();
    };
    for request in requests {
        next(CodeRangeKind::InterpEntry {
            func_index: request.func_index,
        });
        if request.with_jit_entry {
            next(CodeRangeKind::JitEntry {
                func_index: request.func_index,
            });
        }
    }
}

impl Code {
    /// Generate entry stubs for `funcs`, calling into their bodies in
    /// `tier_block`, as one new block.
    pub(crate) fn create_many_entry_stubs(
        &self,
        data: &mut CodeData,
        funcs: &[FunctionIndex],
        tier_block: &CodeBlock,
    ) -> Result<CodeBlockIndex, CompileError> {
        assert!(!funcs.is_empty());
        let module = self.module();
        let tunables = self.runtime().tunables();

        let requests: Vec<EntryStubRequest<'_>> = funcs
            .iter()
            .map(|&func_index| {
                let callee = tier_block
                    .func_unchecked_call_entry(func_index)
                    .unwrap_or_else(|| {
                        panic!("{func_index} has no code in the {} block", tier_block.kind())
                    });
                let func_type = module.func_type(func_index);
                EntryStubRequest {
                    func_index,
                    func_type,
                    callee,
                    with_jit_entry: tunables.jit_entries && func_type.can_have_jit_entry(),
                }
            })
            .collect();

        let compiled = self.generator().compile_entry_stubs(module, &requests)?;
        check_stub_ranges(&requests, &compiled.metadata.code_ranges);

        let code_length = compiled.bytes.len();
        let pad = funcs.len() == 1 && tunables.randomize_stub_padding;
        let allocation = data.lazy_stubs.claim(
            self.runtime().allocator(),
            tunables.lazy_stub_segment_size,
            code_length,
            pad,
        )?;

        let segment = &allocation.segment;
        // The claim was made under the write lock and nothing points into
        // it yet.
        let mut writable =
            unsafe { segment.writable(allocation.allocation_start, allocation.allocation_length) }?;
        let begin = allocation.code_start - allocation.allocation_start;
        writable.as_mut_slice()[begin..begin + code_length].copy_from_slice(&compiled.bytes);
        segment.link_and_make_executable_sub_range(
            writable,
            &compiled.link_data,
            allocation.code_start,
            code_length,
            self.runtime().symbols(),
            None,
        )?;

        let block = Arc::new(CodeBlock::new(
            CodeBlockKind::LazyStubs,
            tier_block.tier(),
            allocation.segment.clone(),
            allocation.code_start,
            code_length,
            compiled.metadata,
        ));
        let block_index = self.add_code_block(data, block.clone(), None)?;

        let mut range_index = 0;
        for request in &requests {
            data.lazy_stubs.merge(LazyFuncExport {
                func_index: request.func_index,
                tier: block.tier(),
                block_index,
                func_code_range_index: CodeRangeIndex::new(range_index),
            });
            range_index += 1 + request.with_jit_entry as usize;
        }

        tracing::debug!(
            code = %self.id(),
            block = %block_index,
            num_funcs = funcs.len(),
            tier = %block.tier(),
            "created lazy entry stubs"
        );
        Ok(block_index)
    }

    /// Generate optimized-tier stubs for every function that has
    /// baseline-tier lazy stubs, so that none of them is left calling the
    /// old tier once `tier2_block` is live.
    pub(crate) fn create_tier2_lazy_entry_stubs(
        &self,
        data: &mut CodeData,
        tier2_block: &CodeBlock,
    ) -> Result<Option<CodeBlockIndex>, CompileError> {
        let funcs: Vec<FunctionIndex> = data
            .lazy_stubs
            .exports()
            .iter()
            .filter(|export| export.tier < tier2_block.tier())
            .filter(|export| tier2_block.func_code_range(export.func_index).is_some())
            .map(|export| export.func_index)
            .collect();
        if funcs.is_empty() {
            return Ok(None);
        }
        self.create_many_entry_stubs(data, &funcs, tier2_block)
            .map(Some)
    }
}
