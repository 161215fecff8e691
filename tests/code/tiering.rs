use crate::common::*;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use wasmer_code::{Code, CodeBlockKind, HelperThreads, ProcessRuntimeState};
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{CompileMode, FunctionIndex, Tier, TierUpState};

struct Fixture {
    runtime: Arc<ProcessRuntimeState>,
    helpers: Arc<QueuedHelpers>,
    generator: Arc<FakeGenerator>,
    code: Arc<Code>,
}

fn fixture(mode: CompileMode, num_funcs: usize) -> Result<Fixture> {
    let helpers = QueuedHelpers::new();
    let runtime = runtime(helpers.clone());
    let generator = FakeGenerator::new();
    let module = module(mode, num_funcs);
    let code = Code::new(
        &runtime,
        module.clone(),
        generator.clone(),
        Tier::Baseline,
        compile_funcs(&all_funcs(&module), Tier::Baseline, false),
        None,
    )?;
    Ok(Fixture {
        runtime,
        helpers,
        generator,
        code,
    })
}

fn stub_callee(code: &Code, func: FunctionIndex) -> usize {
    let stub = code.lookup_stub(func).unwrap();
    let block = code.code_block(stub.block_index).unwrap();
    let range = block.code_range(stub.func_code_range_index);
    read_u64(block.bytes(range.begin(), range.end()), 0) as usize
}

#[test_log::test]
fn eager_tier2_replaces_the_whole_module() -> Result<()> {
    let Fixture {
        runtime,
        helpers,
        code,
        ..
    } = fixture(CompileMode::EagerTiering, 3)?;
    let f0 = FunctionIndex::new(0);
    let f1 = FunctionIndex::new(1);
    let baseline_f0 = code.tier1().func_unchecked_call_entry(f0).unwrap();

    // A stub created before tier 2 calls the baseline body.
    code.get_or_create_interp_entry(f0)?;
    assert_eq!(stub_callee(&code, f0), baseline_f0);

    let handle = code.start_tier2()?;
    assert!(!handle.is_cancelled());
    assert_eq!(helpers.len(), 1);
    assert!(!code.has_complete_tier2());
    assert_eq!(code.best_complete_tier(), Tier::Baseline);

    assert_eq!(helpers.run_all(), 1);
    assert!(code.has_complete_tier2());
    assert_eq!(code.best_complete_tier(), Tier::Optimized);
    let tier2 = code.tier2().unwrap().clone();
    assert_eq!(tier2.kind(), CodeBlockKind::OptimizedTier);
    assert_eq!(code.best_tier(f1), Tier::Optimized);
    assert!(runtime.is_wasm_code(tier2.code_base()));

    // Tiering entries moved and are frozen from now on.
    assert!(code.jump_tables().is_tiering_complete());
    assert_eq!(
        code.jump_tables().tiering_entry(f1) as usize,
        tier2.func_tier_entry(f1).unwrap()
    );

    // The stub was regenerated against the optimized body, and JIT callers
    // were redirected to it.
    let stub = code.lookup_stub(f0).unwrap();
    assert_eq!(stub.tier, Tier::Optimized);
    assert_eq!(stub_callee(&code, f0), tier2.func_unchecked_call_entry(f0).unwrap());
    let stubs = code.code_block(stub.block_index).unwrap();
    assert_eq!(
        code.jump_tables().jit_entry(f0) as usize,
        stubs.address_of(stubs.code_ranges()[1].begin())
    );

    // Far jumps were resolved to the best entry at link time.
    let body = tier2.func_code_range(f1).unwrap();
    let bytes = tier2.bytes(body.begin(), body.end());
    assert_eq!(read_u64(bytes, FAR_JUMP_OFFSET as usize) as usize, baseline_f0);

    // Tier 2 keeps its link data, lazy stubs do not.
    assert!(code.link_data(tier2.index().unwrap()).is_some());
    assert!(code.link_data(stub.block_index).is_none());
    Ok(())
}

#[test]
fn the_tier2_latch_never_goes_back() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::EagerTiering, 2)?;
    code.start_tier2()?;

    let observed = thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            let mut seen = Vec::new();
            for _ in 0..10_000 {
                let complete = code.has_complete_tier2();
                if seen.last() != Some(&complete) {
                    seen.push(complete);
                }
                if complete {
                    // Once the latch is set, the tier is there to read.
                    assert!(code.tier2().is_some());
                }
            }
            seen
        });
        helpers.run_all();
        watcher.join().unwrap()
    });
    assert!(observed == [false] || observed == [false, true] || observed == [true]);
    assert!(code.has_complete_tier2());
    Ok(())
}

#[test]
fn failed_tier2_keeps_the_baseline() -> Result<()> {
    let Fixture {
        helpers,
        generator,
        code,
        ..
    } = fixture(CompileMode::EagerTiering, 2)?;
    generator.fail_tier2.store(true, Ordering::SeqCst);
    code.start_tier2()?;
    helpers.run_all();
    assert!(!code.has_complete_tier2());
    assert_eq!(code.best_complete_tier(), Tier::Baseline);
    assert!(!code.jump_tables().is_tiering_complete());
    Ok(())
}

#[test]
fn cancelled_tier2_is_discarded() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::EagerTiering, 2)?;
    let handle = code.start_tier2()?;
    handle.cancel();
    assert!(handle.is_cancelled());
    helpers.run_all();
    assert!(!code.has_complete_tier2());
    assert_eq!(code.num_code_blocks(), 1);
    Ok(())
}

#[test]
fn cancelled_tier2_can_be_started_again() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::EagerTiering, 2)?;
    let first = code.start_tier2()?;
    code.cancel_background_compilation();
    assert!(first.is_cancelled());
    assert_eq!(helpers.run_all(), 1);
    assert!(!code.has_complete_tier2());

    let second = code.start_tier2()?;
    assert!(!second.is_cancelled());
    assert_eq!(helpers.run_all(), 1);
    assert!(code.has_complete_tier2());
    assert_eq!(code.best_complete_tier(), Tier::Optimized);
    Ok(())
}

#[test]
fn cancelling_tier_ups_spares_later_requests() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::LazyTiering, 2)?;
    let f0 = FunctionIndex::new(0);
    let f1 = FunctionIndex::new(1);

    assert!(code.request_tier_up(f0));
    code.cancel_background_compilation();
    assert_eq!(helpers.run_all(), 1);
    assert_eq!(code.tier_up_state(f0), TierUpState::Requested);
    assert_eq!(code.best_tier(f0), Tier::Baseline);

    assert!(code.request_tier_up(f1));
    assert_eq!(helpers.run_all(), 1);
    assert_eq!(code.tier_up_state(f1), TierUpState::Finished);
    assert_eq!(code.best_tier(f1), Tier::Optimized);
    Ok(())
}

#[test]
fn tier2_tasks_do_not_keep_code_alive() -> Result<()> {
    let Fixture {
        runtime,
        helpers,
        code,
        ..
    } = fixture(CompileMode::EagerTiering, 2)?;
    code.start_tier2()?;
    drop(code);
    assert_eq!(helpers.run_all(), 1);
    assert_eq!(runtime.num_registered_blocks(), 0);
    Ok(())
}

#[test]
#[should_panic(expected = "tier 2 finished twice")]
fn tier2_is_installed_once() {
    let Fixture { code, .. } = fixture(CompileMode::EagerTiering, 2).unwrap();
    let module = code.module().clone();
    code.finish_tier2(compile_funcs(&all_funcs(&module), Tier::Optimized, false))
        .unwrap();
    let _ = code.finish_tier2(compile_funcs(&all_funcs(&module), Tier::Optimized, false));
}

#[test]
fn concurrent_tier_up_requests_schedule_one_task() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::LazyTiering, 3)?;
    let func = FunctionIndex::new(1);
    assert_eq!(code.tier_up_state(func), TierUpState::NotRequested);

    let results: Vec<bool> = thread::scope(|scope| {
        let a = scope.spawn(|| code.request_tier_up(func));
        let b = scope.spawn(|| code.request_tier_up(func));
        vec![a.join().unwrap(), b.join().unwrap()]
    });
    assert_eq!(results, vec![true, true]);
    assert_eq!(helpers.len(), 1);
    assert_eq!(code.tier_up_state(func), TierUpState::Requested);
    assert!(helpers.task_names()[0].contains("tier-up"));
    Ok(())
}

#[test_log::test]
fn lazy_tier_up_moves_one_function() -> Result<()> {
    let Fixture {
        runtime,
        helpers,
        code,
        ..
    } = fixture(CompileMode::LazyTiering, 3)?;
    let f0 = FunctionIndex::new(0);
    let f1 = FunctionIndex::new(1);
    let baseline_f0 = code.tier1().func_unchecked_call_entry(f0).unwrap();

    code.get_or_create_interp_entry(f1)?;
    assert!(code.request_tier_up(f1));
    assert_eq!(helpers.run_all(), 1);

    assert_eq!(code.tier_up_state(f1), TierUpState::Finished);
    assert_eq!(code.best_tier(f1), Tier::Optimized);
    assert_eq!(code.best_tier(f0), Tier::Baseline);
    assert_eq!(code.best_complete_tier(), Tier::Baseline);
    assert!(!code.has_complete_tier2());

    let block = code.func_code_block(f1);
    assert_eq!(block.kind(), CodeBlockKind::OptimizedTier);
    assert!(runtime.is_wasm_code(block.code_base()));
    assert_eq!(
        code.jump_tables().tiering_entry(f1) as usize,
        block.func_tier_entry(f1).unwrap()
    );
    assert_eq!(
        code.jump_tables().tiering_entry(f0) as usize,
        code.tier1().func_tier_entry(f0).unwrap()
    );

    // The baseline stub was replaced by one calling the optimized body.
    let stub = code.lookup_stub(f1).unwrap();
    assert_eq!(stub.tier, Tier::Optimized);
    assert_eq!(stub_callee(&code, f1), block.func_unchecked_call_entry(f1).unwrap());

    let body = block.func_code_range(f1).unwrap();
    let bytes = block.bytes(body.begin(), body.end());
    assert_eq!(read_u64(bytes, FAR_JUMP_OFFSET as usize) as usize, baseline_f0);

    // Finished functions never ask again.
    assert!(code.request_tier_up(f1));
    assert_eq!(helpers.len(), 0);
    Ok(())
}

#[test]
fn far_jumps_follow_earlier_tier_ups() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::LazyTiering, 3)?;
    let f0 = FunctionIndex::new(0);
    let f1 = FunctionIndex::new(1);

    code.request_tier_up(f0);
    helpers.run_all();
    let optimized_f0 = code.func_code_block(f0).func_unchecked_call_entry(f0).unwrap();

    code.request_tier_up(f1);
    helpers.run_all();
    let block = code.func_code_block(f1);
    let body = block.func_code_range(f1).unwrap();
    let bytes = block.bytes(body.begin(), body.end());
    assert_eq!(read_u64(bytes, FAR_JUMP_OFFSET as usize) as usize, optimized_f0);
    Ok(())
}

#[test]
fn tier_up_states_only_move_forward() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::LazyTiering, 2)?;
    let func = FunctionIndex::new(0);

    let observed = thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            let mut seen = vec![code.tier_up_state(func)];
            for _ in 0..10_000 {
                let state = code.tier_up_state(func);
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
            }
            seen
        });
        code.request_tier_up(func);
        helpers.run_all();
        watcher.join().unwrap()
    });
    assert!(observed.windows(2).all(|pair| pair[0] < pair[1]), "{observed:?}");
    assert_eq!(code.tier_up_state(func), TierUpState::Finished);
    Ok(())
}

#[test]
fn unschedulable_tier_ups_stay_requested() -> Result<()> {
    let runtime = runtime(Arc::new(NoHelpers) as Arc<dyn HelperThreads>);
    let module = module(CompileMode::LazyTiering, 2);
    let code = Code::new(
        &runtime,
        module.clone(),
        FakeGenerator::new(),
        Tier::Baseline,
        compile_funcs(&all_funcs(&module), Tier::Baseline, false),
        None,
    )?;
    let func = FunctionIndex::new(0);

    assert!(!code.request_tier_up(func));
    assert_eq!(code.tier_up_state(func), TierUpState::Requested);
    // Nobody will finish it, but it is not scheduled again either.
    assert!(code.request_tier_up(func));
    assert_eq!(code.best_tier(func), Tier::Baseline);
    Ok(())
}

#[test]
fn only_lazy_tiering_tiers_up_functions() -> Result<()> {
    let Fixture { helpers, code, .. } = fixture(CompileMode::EagerTiering, 2)?;
    assert!(!code.request_tier_up(FunctionIndex::new(0)));
    assert_eq!(helpers.len(), 0);

    let Fixture { helpers, code, .. } = fixture(CompileMode::Once, 2)?;
    assert!(!code.request_tier_up(FunctionIndex::new(0)));
    assert_eq!(helpers.len(), 0);
    assert!(code.jump_tables().tiering_table().is_null());
    Ok(())
}

#[test]
#[should_panic(expected = "without a pending request")]
fn unrequested_tier_ups_are_fatal() {
    let Fixture { code, .. } = fixture(CompileMode::LazyTiering, 2).unwrap();
    let func = FunctionIndex::new(0);
    let _ = code.finish_tier2_function(func, compile_funcs(&[func], Tier::Optimized, false));
}
