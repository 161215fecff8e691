//! Moving a module's code to the optimized tier in the background.
//!
//! With eager tiering the whole module is recompiled once and switched over
//! in a single step. With lazy tiering individual functions are recompiled
//! when asked for, each one moving through
//! `NotRequested -> Requested -> Finished` exactly once.

use crate::block::{CodeBlock, CodeBlockKind};
use crate::code::Code;
use crate::segment::CodeSegment;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wasmer_code_types::{
    CompileError, CompileMode, CompiledCode, FunctionIndex, LinkData, ScheduleError, Tier,
    TierUpState,
};
use wasmer_code_vm::flush_execution_context_for_all_threads;

/// Handle on a scheduled whole-module tier-up.
#[derive(Debug, Clone)]
pub struct Tier2Handle {
    cancelled: Arc<AtomicBool>,
}

impl Tier2Handle {
    /// Ask the background compilation to stop. Its result, if any, is
    /// discarded.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether this compilation was cancelled, through this handle or
    /// [`Code::cancel_background_compilation`].
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Code {
    fn create_optimized_block(
        &self,
        compiled: CompiledCode,
    ) -> Result<(Arc<CodeBlock>, LinkData), CompileError> {
        let CompiledCode {
            bytes,
            link_data,
            metadata,
        } = compiled;
        let runtime = self.runtime();
        let best_entry = |func_index: FunctionIndex| self.func_best_entry(func_index);
        let segment = CodeSegment::create_from_bytes(
            runtime.allocator(),
            &bytes,
            &link_data,
            runtime.symbols(),
            Some(&best_entry),
        )?;
        let block = CodeBlock::new(
            CodeBlockKind::OptimizedTier,
            Tier::Optimized,
            segment,
            0,
            bytes.len(),
            metadata,
        );
        Ok((Arc::new(block), link_data))
    }

    /// Schedule optimized compilation of the whole module.
    pub fn start_tier2(&self) -> Result<Tier2Handle, ScheduleError> {
        assert_eq!(
            self.mode(),
            CompileMode::EagerTiering,
            "whole-module tier-up needs eager tiering"
        );
        let code = self.weak();
        let cancelled = self.new_background_task();
        let task_cancelled = cancelled.clone();
        self.runtime().helper_threads().spawn(
            &format!("{}-tier2", self.id()),
            Box::new(move || {
                if let Some(code) = code.upgrade() {
                    code.run_tier2(&task_cancelled);
                }
            }),
        )?;
        tracing::debug!(code = %self.id(), "tier-2 compilation scheduled");
        Ok(Tier2Handle { cancelled })
    }

    fn run_tier2(&self, cancelled: &AtomicBool) {
        let compiled = self.generator().compile_tier2(self.module(), cancelled);
        if cancelled.load(Ordering::Acquire) {
            tracing::debug!(code = %self.id(), "tier-2 compilation cancelled");
            return;
        }
        let result = compiled.and_then(|compiled| self.finish_tier2(compiled));
        if let Err(err) = result {
            tracing::warn!(
                code = %self.id(),
                error = %err,
                "tier-2 compilation failed, staying at the baseline tier"
            );
        }
    }

    /// Install the complete optimized tier.
    ///
    /// Lazy stubs calling baseline code are regenerated against the new
    /// tier before anything points at it. The tier becomes visible in one
    /// step, after which tiering and JIT entries are redirected.
    pub fn finish_tier2(&self, compiled: CompiledCode) -> Result<(), CompileError> {
        assert_eq!(self.mode(), CompileMode::EagerTiering);
        let (block, link_data) = self.create_optimized_block(compiled)?;

        let mut data = self.data.write();
        assert!(self.tier2.get().is_none(), "tier 2 finished twice");
        let index = self.add_code_block(&mut data, block.clone(), Some(link_data))?;
        let stubs = self.create_tier2_lazy_entry_stubs(&mut data, &block)?;

        // Other threads must see the new code before any pointer to it.
        flush_execution_context_for_all_threads();

        let _ = self.tier2.set(block.clone());
        self.has_complete_tier2.store(true, Ordering::Release);

        let jump_tables = self.jump_tables();
        for func_index in block.functions() {
            self.set_func_code_block(func_index, &block);
            if let Some(entry) = block.func_tier_entry(func_index) {
                jump_tables.set_tiering_entry(func_index, entry as *const u8);
            }
        }
        self.publish_jit_entries(&block, true);
        if let Some(stubs) = stubs {
            self.publish_jit_entries(&data.blocks[stubs], true);
        }
        jump_tables.finish_tiering();

        tracing::debug!(code = %self.id(), block = %index, "tier 2 installed");
        Ok(())
    }

    /// Ask for `func_index` to be compiled with the optimizing tier.
    ///
    /// Returns whether an optimized version is, or will be, on its way.
    /// Only the first request schedules a compilation. When it cannot be
    /// scheduled the function stays at its current tier for good.
    pub fn request_tier_up(&self, func_index: FunctionIndex) -> bool {
        if self.mode() != CompileMode::LazyTiering {
            return false;
        }
        let state = self.tier_up_slot(func_index);
        if state
            .compare_exchange(
                TierUpState::NotRequested as u8,
                TierUpState::Requested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return true;
        }

        let code = self.weak();
        let cancelled = self.new_background_task();
        let scheduled = self.runtime().helper_threads().spawn(
            &format!("{}-tier-up-{}", self.id(), func_index),
            Box::new(move || {
                if let Some(code) = code.upgrade() {
                    code.run_tier_up(func_index, &cancelled);
                }
            }),
        );
        match scheduled {
            Ok(()) => {
                tracing::trace!(code = %self.id(), func = %func_index, "tier-up scheduled");
                true
            }
            Err(err) => {
                tracing::warn!(
                    code = %self.id(),
                    func = %func_index,
                    error = %err,
                    "could not schedule tier-up"
                );
                false
            }
        }
    }

    fn run_tier_up(&self, func_index: FunctionIndex, cancelled: &AtomicBool) {
        let compiled =
            self.generator()
                .compile_function(self.module(), func_index, Tier::Optimized, cancelled);
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        let result = compiled.and_then(|compiled| self.finish_tier2_function(func_index, compiled));
        if let Err(err) = result {
            tracing::warn!(
                code = %self.id(),
                func = %func_index,
                error = %err,
                "tier-up failed"
            );
        }
    }

    /// Install optimized code for one function.
    ///
    /// Panics unless a tier-up of the function was requested and has not
    /// finished yet.
    pub fn finish_tier2_function(
        &self,
        func_index: FunctionIndex,
        compiled: CompiledCode,
    ) -> Result<(), CompileError> {
        assert_eq!(self.mode(), CompileMode::LazyTiering);
        assert_eq!(
            self.tier_up_state(func_index),
            TierUpState::Requested,
            "{func_index} finished tiering without a pending request"
        );
        let (block, link_data) = self.create_optimized_block(compiled)?;
        let entry = block
            .func_tier_entry(func_index)
            .unwrap_or_else(|| panic!("optimized code has no body for {func_index}"));

        let mut data = self.data.write();
        self.add_code_block(&mut data, block.clone(), Some(link_data))?;
        let needs_stubs = data
            .lazy_stubs
            .lookup(func_index)
            .is_some_and(|export| export.tier < block.tier());
        let stubs = if needs_stubs {
            Some(self.create_many_entry_stubs(&mut data, &[func_index], &block)?)
        } else {
            None
        };

        flush_execution_context_for_all_threads();

        self.set_func_code_block(func_index, &block);
        self.tier_up_slot(func_index)
            .store(TierUpState::Finished as u8, Ordering::Release);
        self.jump_tables()
            .set_tiering_entry(func_index, entry as *const u8);
        if let Some(stubs) = stubs {
            self.publish_jit_entries(&data.blocks[stubs], true);
        }

        tracing::debug!(code = %self.id(), func = %func_index, "function tiered up");
        Ok(())
    }
}
