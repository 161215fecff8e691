//! Linking of freshly copied code.

use crate::traits::SymbolicAddressResolver;
use more_asserts::assert_le;
use std::ptr::{read_unaligned, write_unaligned};
use wasmer_code_types::{
    FunctionIndex, InternalLink, LinkData, RelocationKind, INTERNAL_PLACEHOLDER,
    SYMBOLIC_PLACEHOLDER,
};

/// Resolves the current best entry of a function, for far jumps.
pub type FarJumpResolver<'a> = &'a dyn Fn(FunctionIndex) -> usize;

fn field(code: &mut [u8], offset: u32, width: usize) -> *mut u8 {
    let offset = offset as usize;
    assert_le!(offset + width, code.len(), "patch site out of bounds");
    unsafe { code.as_mut_ptr().add(offset) }
}

fn apply_internal_link(code: &mut [u8], base: usize, link: &InternalLink) {
    let target = base + link.target_offset as usize;
    let reloc_address = field(code, link.patch_at_offset, link.kind.width());
    match link.kind {
        RelocationKind::Abs8 => unsafe {
            write_unaligned(reloc_address as *mut u64, target as u64);
        },
        RelocationKind::PCRel4 => unsafe {
            let pc = base + link.patch_at_offset as usize + 4;
            let delta = (target as i64).wrapping_sub(pc as i64);
            let delta = i32::try_from(delta).unwrap_or_else(|_| {
                panic!(
                    "Relocation too big for {:?} at {:#x} with {:x}",
                    link.kind, link.patch_at_offset, delta
                )
            });
            write_unaligned(reloc_address as *mut i32, delta);
        },
    }
}

fn patch_with_verification(code: &mut [u8], offset: u32, expected: u64, value: u64) {
    let reloc_address = field(code, offset, 8) as *mut u64;
    unsafe {
        let current = read_unaligned(reloc_address);
        assert_eq!(
            current, expected,
            "unexpected value {current:#x} at patch site {offset:#x}"
        );
        write_unaligned(reloc_address, value);
    }
}

/// Patch `code`, which will run at address `base`, as described by `link`.
///
/// Symbolic sites must hold [`SYMBOLIC_PLACEHOLDER`]; anything else means
/// the generator and the linker disagree and is a fatal error. Far jumps
/// need `far_jumps` to tell where each target function currently lives.
pub fn statically_link(
    code: &mut [u8],
    base: usize,
    link: &LinkData,
    symbols: &dyn SymbolicAddressResolver,
    far_jumps: Option<FarJumpResolver<'_>>,
) {
    for internal in &link.internal_links {
        apply_internal_link(code, base, internal);
    }

    for (symbol, offsets) in link.symbols() {
        let target = symbols.resolve(symbol) as u64;
        for &offset in offsets {
            patch_with_verification(code, offset, SYMBOLIC_PLACEHOLDER, target);
        }
    }

    if !link.far_jumps.is_empty() {
        let resolve = far_jumps.expect("far jumps are only allowed in tiered code");
        for jump in &link.far_jumps {
            let target = resolve(jump.func_index) as u64;
            let reloc_address = field(code, jump.jump_offset, 8);
            unsafe { write_unaligned(reloc_address as *mut u64, target) };
        }
    }
}

/// Undo [`statically_link`]: every site goes back to its placeholder.
pub fn statically_unlink(code: &mut [u8], link: &LinkData) {
    for internal in &link.internal_links {
        let reloc_address = field(code, internal.patch_at_offset, internal.kind.width());
        match internal.kind {
            RelocationKind::Abs8 => unsafe {
                write_unaligned(reloc_address as *mut u64, INTERNAL_PLACEHOLDER);
            },
            RelocationKind::PCRel4 => unsafe {
                write_unaligned(reloc_address as *mut u32, INTERNAL_PLACEHOLDER as u32);
            },
        }
    }

    for (_, offsets) in link.symbols() {
        for &offset in offsets {
            let reloc_address = field(code, offset, 8);
            unsafe { write_unaligned(reloc_address as *mut u64, SYMBOLIC_PLACEHOLDER) };
        }
    }

    for jump in &link.far_jumps {
        let reloc_address = field(code, jump.jump_offset, 8);
        unsafe { write_unaligned(reloc_address as *mut u64, INTERNAL_PLACEHOLDER) };
    }
}
