use crate::common::*;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use wasmer_code::{
    install_global, process_global, Code, CodeBlockKind, CodeProfiler, ProcessRuntimeState,
};
use wasmer_code_types::entity::EntityRef;
use wasmer_code_types::{CodeTunables, CompileError, CompileMode, FunctionIndex, Tier, TrapCode};

fn new_code(runtime: &Arc<ProcessRuntimeState>, num_funcs: usize) -> Result<Arc<Code>> {
    let module = module(CompileMode::Once, num_funcs);
    Ok(Code::new(
        runtime,
        module.clone(),
        FakeGenerator::new(),
        Tier::Baseline,
        compile_funcs(&all_funcs(&module), Tier::Baseline, false),
        None,
    )?)
}

#[test]
fn published_code_is_found_by_pc() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let code = new_code(&runtime, 3)?;
    let tier1 = code.tier1();
    let base = tier1.code_base();

    assert_eq!(runtime.num_registered_blocks(), 1);
    assert!(runtime.is_wasm_code(base));
    assert!(runtime.is_wasm_code(base + 3 * FUNC_SIZE as usize - 1));
    assert!(!runtime.is_wasm_code(base + 3 * FUNC_SIZE as usize));

    let pc = tier1.func_unchecked_call_entry(FunctionIndex::new(1)).unwrap() + TRAP_OFFSET as usize;
    let trap = runtime.lookup_trap(pc).unwrap();
    assert_eq!(trap.trap, TrapCode::Unreachable);
    assert_eq!(trap.bytecode_offset, 1);
    assert_eq!(code.lookup_trap(pc), Some(trap));
    assert_eq!(
        code.lookup_code_range(pc).and_then(|range| range.func_index()),
        Some(FunctionIndex::new(1))
    );
    assert_eq!(
        code.lookup_block_kind(pc),
        Some((CodeBlockKind::BaselineTier, Tier::Baseline))
    );
    assert_eq!(
        runtime.lookup_code_block(pc, |block| block.code_id()),
        Some(Some(code.id()))
    );

    drop(code);
    assert!(!runtime.is_wasm_code(pc));
    assert_eq!(runtime.num_registered_blocks(), 0);
    Ok(())
}

#[test]
fn code_lookups_only_see_their_own_blocks() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let a = new_code(&runtime, 2)?;
    let b = new_code(&runtime, 2)?;
    assert_ne!(a.id(), b.id());

    let pc_in_b = b.tier1().code_base() + TRAP_OFFSET as usize;
    assert!(runtime.lookup_trap(pc_in_b).is_some());
    assert!(b.contains_pc(pc_in_b));
    assert!(!a.contains_pc(pc_in_b));
    assert_eq!(a.lookup_trap(pc_in_b), None);
    assert_eq!(a.lookup_code_range(pc_in_b), None);
    Ok(())
}

#[test]
fn blocks_know_their_code() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let code = new_code(&runtime, 1)?;
    let tier1 = code.tier1();
    assert!(tier1.is_registered());
    assert_eq!(tier1.code_id(), Some(code.id()));
    assert_eq!(tier1.segment().owner(), Some(code.id()));
    assert!(Arc::ptr_eq(&tier1.code().unwrap(), &code));
    assert_eq!(tier1.index().map(|i| i.index()), Some(0));
    Ok(())
}

#[test]
fn shared_stubs_get_a_block_of_their_own() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let module = module(CompileMode::Once, 2);
    let shared = compile_funcs(&[FunctionIndex::new(0)], Tier::Baseline, false);
    let code = Code::new(
        &runtime,
        module.clone(),
        FakeGenerator::new(),
        Tier::Baseline,
        compile_funcs(&all_funcs(&module), Tier::Baseline, false),
        Some(shared),
    )?;
    assert_eq!(code.num_code_blocks(), 2);
    assert_eq!(runtime.num_registered_blocks(), 2);
    let stubs = code.shared_stubs().unwrap();
    assert_eq!(stubs.kind(), CodeBlockKind::SharedStubs);
    assert_eq!(stubs.index().map(|i| i.index()), Some(0));
    assert_eq!(code.tier1().index().map(|i| i.index()), Some(1));
    Ok(())
}

#[test]
fn registration_fails_after_shutdown() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let code = new_code(&runtime, 1)?;
    let pc = code.tier1().code_base();

    runtime.shutdown();
    assert!(runtime.is_shut_down());
    assert!(!runtime.is_wasm_code(pc));
    assert_eq!(code.lookup_trap(pc + TRAP_OFFSET as usize), None);

    let err = new_code(&runtime, 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CompileError>(),
        Some(CompileError::Resource(_))
    ));
    // Dropping code registered before the shutdown is fine.
    drop(code);
    Ok(())
}

#[test]
fn blocks_that_fail_to_register_are_not_kept() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let code = new_code(&runtime, 2)?;
    let func = FunctionIndex::new(1);
    runtime.shutdown();

    let err = code.create_one_entry_stub(func).unwrap_err();
    assert!(matches!(err, CompileError::Resource(_)));
    assert_eq!(code.num_code_blocks(), 1);
    assert_eq!(code.lookup_stub(func), None);
    assert!(code.jump_tables().jit_entry(func).is_null());
    Ok(())
}

#[test]
fn code_dropped_inside_a_lookup_outlives_the_lookup() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let code = new_code(&runtime, 1)?;
    let pc = code.tier1().code_base() + TRAP_OFFSET as usize;
    let mut owner = Some(code);

    let trap = runtime.lookup_code_block(pc, |block| {
        drop(owner.take());
        // Still registered until the outer lookup returns.
        assert!(runtime.is_wasm_code(pc));
        assert!(block.code().is_none());
        block.lookup_trap(pc).map(|site| site.trap)
    });
    assert_eq!(trap, Some(Some(TrapCode::Unreachable)));
    assert!(!runtime.is_wasm_code(pc));
    assert_eq!(runtime.num_registered_blocks(), 0);
    Ok(())
}

#[test]
fn lookups_race_with_registration() -> Result<()> {
    let runtime = runtime(QueuedHelpers::new());
    let stable = new_code(&runtime, 2)?;
    let pc = stable.tier1().code_base() + TRAP_OFFSET as usize;
    let done = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut hits = 0u64;
                    while !done.load(Ordering::Relaxed) {
                        let trap = runtime.lookup_trap(pc).map(|site| site.trap);
                        assert_eq!(trap, Some(TrapCode::Unreachable));
                        hits += 1;
                    }
                    hits
                })
            })
            .collect();

        for _ in 0..50 {
            let churn = new_code(&runtime, 1)?;
            assert!(runtime.is_wasm_code(churn.tier1().code_base()));
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        Ok(())
    })?;

    assert_eq!(runtime.num_registered_blocks(), 1);
    Ok(())
}

#[derive(Default)]
struct RecordingProfiler {
    ranges: Mutex<Vec<(String, usize, usize)>>,
}

impl CodeProfiler for RecordingProfiler {
    fn register_code_range(&self, name: &str, start: usize, len: usize) {
        self.ranges.lock().push((name.to_string(), start, len));
    }
}

#[test]
fn profilers_see_every_function() -> Result<()> {
    let profiler = Arc::new(RecordingProfiler::default());
    let runtime = ProcessRuntimeState::builder(CodeTunables::for_host(), Arc::new(resolve_symbol))
        .helper_threads(QueuedHelpers::new())
        .profiler(profiler.clone())
        .init();
    let code = new_code(&runtime, 2)?;

    let ranges = profiler.ranges.lock();
    assert_eq!(ranges.len(), 2);
    let (name, start, len) = &ranges[1];
    assert!(name.starts_with("func1"), "{name}");
    assert_eq!(
        Some(*start),
        code.tier1().func_unchecked_call_entry(FunctionIndex::new(1))
    );
    assert_eq!(*len, FUNC_SIZE as usize);
    assert_eq!(code.profiling_label(FunctionIndex::new(1)), "func1 (test:1)");
    Ok(())
}

#[test]
fn the_process_runtime_is_installed_once() {
    let first = runtime(QueuedHelpers::new());
    let second = runtime(QueuedHelpers::new());
    install_global(first.clone()).unwrap();
    assert!(install_global(second).is_err());
    assert!(Arc::ptr_eq(process_global().unwrap(), &first));
}
