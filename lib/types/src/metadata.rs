//! Offset-keyed metadata tables attached to a block of machine code.
//!
//! A code generator produces every table with offsets relative to the first
//! byte it emitted. Once the code is placed inside a segment the whole set is
//! rebased in one pass with [`CodeMetadata::offset_by`], before the owning
//! block becomes visible to any other thread.

use crate::code_range::{lookup_code_range, CodeRange};
use crate::entity::EntityRef;
use crate::indexes::{CodeRangeIndex, FunctionIndex};
use crate::trapcode::TrapCode;
use crate::CodeOffset;
use smallvec::SmallVec;
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// What kind of call a [`CallSite`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CallSiteKind {
    /// Direct call to a function of the same module.
    Func,
    /// Call to an imported function.
    Import,
    /// Call through a table.
    Indirect,
    /// Call to a runtime helper resolved by symbolic address.
    Symbolic,
    /// Call into the debugger breakpoint handler.
    Breakpoint,
    /// Call made by an entry stub into the function body.
    EnterFrame,
}

/// A call instruction, identified by the offset of its return address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CallSite {
    /// Offset of the instruction following the call.
    pub return_address_offset: CodeOffset,
    /// Kind of call.
    pub kind: CallSiteKind,
    /// Offset of the call in the function's bytecode.
    pub bytecode_offset: u32,
}

/// An instruction that may fault and has to be reported as a Wasm trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TrapSite {
    /// Offset of the faulting instruction.
    pub pc_offset: CodeOffset,
    /// The trap it raises.
    pub trap: TrapCode,
    /// Offset of the trapping operator in the function's bytecode.
    pub bytecode_offset: u32,
}

/// A region of code protected by an exception handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TryNote {
    /// First byte of the protected body.
    pub try_body_begin: CodeOffset,
    /// One past the last byte of the protected body.
    pub try_body_end: CodeOffset,
    /// Where control continues when an exception is caught.
    pub landing_pad: CodeOffset,
    /// Frame depth to restore before jumping to the landing pad.
    pub landing_pad_frame_depth: u32,
}

impl TryNote {
    /// Whether `offset` lies in the protected body.
    pub fn offset_within_try_body(&self, offset: CodeOffset) -> bool {
        self.try_body_begin <= offset && offset < self.try_body_end
    }

    /// Whether `other` is contained in this note's body.
    fn encloses(&self, other: &TryNote) -> bool {
        self.try_body_begin <= other.try_body_begin && other.try_body_end <= self.try_body_end
    }
}

/// How to unwind a frame whose pc is in the prologue or epilogue of a
/// function, where the frame is only partially set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum UnwindHow {
    /// The frame is complete; ordinary frame-pointer unwinding applies.
    Normal,
    /// Neither the frame pointer nor the return address have been pushed.
    RestoreFpRa,
    /// The return address is pushed but the frame pointer is not.
    RestoreFp,
    /// Frame pointer and link register are still live in registers.
    UseFpLr,
    /// Only the frame pointer is still live in its register.
    UseFp,
}

/// The unwind policy applying from `offset` until the next entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeRangeUnwindInfo {
    /// First byte the policy applies to.
    pub offset: CodeOffset,
    /// The policy.
    pub how: UnwindHow,
}

/// Which stack words hold references at a call's return address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct StackMap {
    /// Return address of the call the map describes.
    pub return_address_offset: CodeOffset,
    /// Number of words covered by the map, below the frame pointer.
    pub frame_words: u32,
    /// Indices of the covered words that hold references.
    pub ref_words: SmallVec<[u32; 4]>,
}

/// Description of an exported (or otherwise externally callable) function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FuncExport {
    /// The exported function.
    pub func_index: FunctionIndex,
    /// The function body range inside the block.
    pub code_range_index: CodeRangeIndex,
    /// Offset of the interpreter entry stub, when it was compiled together
    /// with the tier instead of lazily.
    pub eager_interp_entry_offset: Option<CodeOffset>,
}

impl FuncExport {
    /// Whether the entry stubs were generated eagerly with the tier.
    pub fn has_eager_stubs(&self) -> bool {
        self.eager_interp_entry_offset.is_some()
    }
}

/// All offset-keyed tables describing one unit of code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeMetadata {
    /// Semantic regions, sorted by `begin` and disjoint.
    pub code_ranges: Vec<CodeRange>,
    /// Call sites, sorted by return address.
    pub call_sites: Vec<CallSite>,
    /// Trap sites, sorted by pc.
    pub trap_sites: Vec<TrapSite>,
    /// Exception handler regions, innermost first.
    pub try_notes: Vec<TryNote>,
    /// Run-length encoded unwind policies, sorted by offset.
    pub unwind_infos: Vec<CodeRangeUnwindInfo>,
    /// Stack maps, sorted by return address.
    pub stack_maps: Vec<StackMap>,
    /// Function exports, sorted by function index.
    pub func_exports: Vec<FuncExport>,
}

impl CodeMetadata {
    /// Put every table in the order the lookups rely on.
    ///
    /// Sorting is stable, so generators that already emit sorted tables keep
    /// their order. Try notes are ordered so that a note always comes before
    /// any note enclosing it, which makes the first match of a linear scan
    /// the innermost handler.
    ///
    /// Export entries keep naming the same ranges after these move.
    ///
    /// Panics if two code ranges overlap, or if an export does not name the
    /// body of its function.
    pub fn normalize(&mut self) {
        let mut order: Vec<usize> = (0..self.code_ranges.len()).collect();
        order.sort_by_key(|&idx| self.code_ranges[idx].begin());
        let mut new_index = vec![0; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        self.code_ranges = order.iter().map(|&idx| self.code_ranges[idx]).collect();
        for export in &mut self.func_exports {
            let old = export.code_range_index.index();
            assert!(
                old < new_index.len(),
                "export of {} names missing code range {old}",
                export.func_index
            );
            export.code_range_index = CodeRangeIndex::new(new_index[old]);
            let range = &self.code_ranges[export.code_range_index.index()];
            assert!(
                range.is_function() && range.func_index() == Some(export.func_index),
                "export of {} names {:?}",
                export.func_index,
                range
            );
        }
        for pair in self.code_ranges.windows(2) {
            assert!(
                pair[0].end() <= pair[1].begin(),
                "overlapping code ranges {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
        self.call_sites.sort_by_key(|site| site.return_address_offset);
        self.trap_sites.sort_by_key(|site| site.pc_offset);
        self.unwind_infos.sort_by_key(|info| info.offset);
        self.stack_maps.sort_by_key(|map| map.return_address_offset);
        self.func_exports.sort_by_key(|export| export.func_index);
        self.try_notes.sort_by(|a, b| {
            b.try_body_begin
                .cmp(&a.try_body_begin)
                .then(a.try_body_end.cmp(&b.try_body_end))
        });
        debug_assert!(self.try_notes_innermost_first());
    }

    fn try_notes_innermost_first(&self) -> bool {
        self.try_notes.iter().enumerate().all(|(i, inner)| {
            self.try_notes[..i]
                .iter()
                .all(|earlier| earlier == inner || !earlier.encloses(inner) || inner.encloses(earlier))
        })
    }

    /// Rebase every offset by `delta`.
    pub fn offset_by(&mut self, delta: CodeOffset) {
        if delta == 0 {
            return;
        }
        for range in &mut self.code_ranges {
            range.offset_by(delta);
        }
        for site in &mut self.call_sites {
            site.return_address_offset += delta;
        }
        for site in &mut self.trap_sites {
            site.pc_offset += delta;
        }
        for note in &mut self.try_notes {
            note.try_body_begin += delta;
            note.try_body_end += delta;
            note.landing_pad += delta;
        }
        for info in &mut self.unwind_infos {
            info.offset += delta;
        }
        for map in &mut self.stack_maps {
            map.return_address_offset += delta;
        }
        for export in &mut self.func_exports {
            if let Some(offset) = &mut export.eager_interp_entry_offset {
                *offset += delta;
            }
        }
    }

    /// The code range covering `offset`.
    pub fn lookup_range(&self, offset: CodeOffset) -> Option<&CodeRange> {
        lookup_code_range(&self.code_ranges, offset)
    }

    /// The call site whose return address is exactly `offset`.
    pub fn lookup_call_site(&self, offset: CodeOffset) -> Option<&CallSite> {
        self.call_sites
            .binary_search_by_key(&offset, |site| site.return_address_offset)
            .ok()
            .map(|idx| &self.call_sites[idx])
    }

    /// The trap site at exactly `offset`.
    pub fn lookup_trap(&self, offset: CodeOffset) -> Option<&TrapSite> {
        self.trap_sites
            .binary_search_by_key(&offset, |site| site.pc_offset)
            .ok()
            .map(|idx| &self.trap_sites[idx])
    }

    /// The innermost try note protecting `offset`.
    ///
    /// Notes may nest, so this is a linear scan returning the first hit.
    pub fn lookup_try_note(&self, offset: CodeOffset) -> Option<&TryNote> {
        self.try_notes
            .iter()
            .find(|note| note.offset_within_try_body(offset))
    }

    /// The unwind policy in effect at `offset`, or `None` when ordinary
    /// frame unwinding applies.
    pub fn lookup_unwind_info(&self, offset: CodeOffset) -> Option<&CodeRangeUnwindInfo> {
        let idx = match self
            .unwind_infos
            .binary_search_by_key(&offset, |info| info.offset)
        {
            Ok(idx) => idx,
            // Before the first entry nothing special applies.
            Err(0) => return None,
            Err(next) => next - 1,
        };
        let info = &self.unwind_infos[idx];
        match info.how {
            UnwindHow::Normal => None,
            _ => Some(info),
        }
    }

    /// The stack map recorded for the return address `offset`.
    pub fn lookup_stack_map(&self, offset: CodeOffset) -> Option<&StackMap> {
        self.stack_maps
            .binary_search_by_key(&offset, |map| map.return_address_offset)
            .ok()
            .map(|idx| &self.stack_maps[idx])
    }

    /// The export entry of `func_index`, with its position in the table.
    pub fn lookup_func_export(&self, func_index: FunctionIndex) -> Option<(usize, &FuncExport)> {
        self.func_exports
            .binary_search_by_key(&func_index, |export| export.func_index)
            .ok()
            .map(|idx| (idx, &self.func_exports[idx]))
    }
}
