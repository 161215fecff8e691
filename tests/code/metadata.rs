use crate::common::*;
use anyhow::Result;
use pretty_assertions::assert_eq;
use smallvec::smallvec;
use std::sync::Arc;
use wasmer_code::{statically_unlink, Code};
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{
    CallSite, CallSiteKind, CodeRange, CodeRangeUnwindInfo, CompileMode, CompiledCode, FunctionIndex,
    StackMap, Tier, TryNote, UnwindHow,
};

fn note(begin: u32, end: u32, landing_pad: u32) -> TryNote {
    TryNote {
        try_body_begin: begin,
        try_body_end: end,
        landing_pad,
        landing_pad_frame_depth: 16,
    }
}

/// One function of 128 bytes with every kind of table filled in.
fn annotated() -> CompiledCode {
    let mut compiled = compile_funcs(&[FunctionIndex::new(0)], Tier::Baseline, false);
    compiled.bytes.resize(128, BASELINE_FILL);
    let range = &mut compiled.metadata.code_ranges[0];
    *range = CodeRange::new(range.kind(), 0, 128);
    // Outer note first, as a generator walking the bytecode emits them.
    compiled.metadata.try_notes = vec![note(0, 100, 110), note(20, 50, 120)];
    compiled.metadata.call_sites = vec![CallSite {
        return_address_offset: 40,
        kind: CallSiteKind::Func,
        bytecode_offset: 3,
    }];
    compiled.metadata.stack_maps = vec![StackMap {
        return_address_offset: 40,
        frame_words: 4,
        ref_words: smallvec![1, 3],
    }];
    compiled.metadata.unwind_infos = vec![
        CodeRangeUnwindInfo {
            offset: 0,
            how: UnwindHow::RestoreFpRa,
        },
        CodeRangeUnwindInfo {
            offset: 4,
            how: UnwindHow::Normal,
        },
        CodeRangeUnwindInfo {
            offset: 124,
            how: UnwindHow::RestoreFp,
        },
    ];
    compiled
}

fn new_code(keep_link_data: bool, compiled: CompiledCode) -> Result<(Arc<Code>, usize)> {
    let runtime = runtime(QueuedHelpers::new());
    let mut module = (*module(CompileMode::Once, 1)).clone();
    module.keep_link_data = keep_link_data;
    let code = Code::new(
        &runtime,
        Arc::new(module),
        FakeGenerator::new(),
        Tier::Baseline,
        compiled,
        None,
    )?;
    let base = code.tier1().code_base();
    Ok((code, base))
}

#[test]
fn the_innermost_try_note_wins() -> Result<()> {
    let (code, base) = new_code(false, annotated())?;

    let inner = code.lookup_try_note(base + 30).unwrap();
    assert_eq!((inner.try_body_begin, inner.try_body_end), (20, 50));
    let outer = code.lookup_try_note(base + 60).unwrap();
    assert_eq!((outer.try_body_begin, outer.try_body_end), (0, 100));
    assert_eq!(code.lookup_try_note(base + 110), None);
    Ok(())
}

#[test]
fn call_sites_and_stack_maps_are_keyed_by_return_address() -> Result<()> {
    let (code, base) = new_code(false, annotated())?;

    let site = code.lookup_call_site(base + 40).unwrap();
    assert_eq!(site.bytecode_offset, 3);
    assert_eq!(code.lookup_call_site(base + 39), None);
    let map = code.lookup_stack_map(base + 40).unwrap();
    assert_eq!(map.ref_words.as_slice(), &[1, 3]);
    assert_eq!(code.lookup_stack_map(base + 41), None);
    Ok(())
}

#[test]
fn unwind_info_only_reports_partial_frames() -> Result<()> {
    let (code, base) = new_code(false, annotated())?;

    let how = |pc| code.lookup_unwind_info(pc).map(|info| info.how);
    assert_eq!(how(base), Some(UnwindHow::RestoreFpRa));
    assert_eq!(how(base + 3), Some(UnwindHow::RestoreFpRa));
    assert_eq!(how(base + 4), None);
    assert_eq!(how(base + 100), None);
    assert_eq!(how(base + 127), Some(UnwindHow::RestoreFp));
    assert_eq!(how(base + 128), None);
    Ok(())
}

#[test]
fn linked_code_unlinks_to_what_the_generator_emitted() -> Result<()> {
    let compiled = compile_funcs(&[FunctionIndex::new(0)], Tier::Baseline, false);
    let original = compiled.bytes.clone();
    let (code, _) = new_code(true, compiled)?;

    let tier1 = code.tier1();
    let link_data = code.link_data(tier1.index().unwrap()).unwrap();
    let mut bytes = tier1.bytes(0, tier1.code_length() as u32).to_vec();
    assert_ne!(bytes, original);
    statically_unlink(&mut bytes, &link_data);
    assert_eq!(bytes, original);
    Ok(())
}

#[test]
fn link_data_is_dropped_unless_asked_for() -> Result<()> {
    let compiled = compile_funcs(&[FunctionIndex::new(0)], Tier::Baseline, false);
    let (code, _) = new_code(false, compiled)?;
    assert_eq!(code.link_data(code.tier1().index().unwrap()), None);
    Ok(())
}
