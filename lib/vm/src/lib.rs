//! Runtime support for placing WebAssembly code in memory.
//!
//! This crate owns the pieces that touch raw machine state: executable
//! memory mappings, instruction cache maintenance, the jump tables running
//! code reads its callees from, and the process-wide map from program
//! counters to code.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(clippy::new_without_default, clippy::vtable_address_comparisons)
)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::map_unwrap_or,
        clippy::print_stdout,
        clippy::use_self
    )
)]

mod cache;
mod code_map;
mod jump_tables;
mod mmap;

pub use crate::cache::{flush_execution_context_for_all_threads, flush_icache};
pub use crate::code_map::{defer_until_lookups_end, in_code_map_lookup, CodeMap};
pub use crate::jump_tables::JumpTables;
pub use crate::mmap::{
    allocation_granularity, os_page_size, round_down_to_page_size, round_up_to_page_size,
    ExecutableAllocator, ExecutableMemory, LastDitch, WritableRange,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
