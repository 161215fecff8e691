//! Code management for compiled WebAssembly modules.
//!
//! Machine code produced by a code generator is copied into
//! [`CodeSegment`]s, linked, made executable and published as
//! [`CodeBlock`]s. All blocks of a module belong to one [`Code`], which
//! moves the module from its baseline tier to optimized code in the
//! background and creates entry stubs on first use. Every published block
//! is registered with the [`ProcessRuntimeState`], so any thread can map a
//! program counter back to the code containing it.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(feature = "cargo-clippy", allow(clippy::new_without_default))]
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

mod block;
mod code;
mod lazy_stubs;
mod link;
mod runtime;
mod segment;
mod tiering;
mod traits;

pub use crate::block::{CodeBlock, CodeBlockKind};
pub use crate::code::Code;
pub use crate::lazy_stubs::LazyFuncExport;
pub use crate::link::{statically_link, statically_unlink, FarJumpResolver};
pub use crate::runtime::{
    install_global, process_global, CodeId, ProcessRuntimeBuilder, ProcessRuntimeState,
};
pub use crate::segment::CodeSegment;
pub use crate::tiering::Tier2Handle;
pub use crate::traits::{
    CodeGenerator, CodeProfiler, HelperThreads, SymbolicAddressResolver, ThreadSpawner,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
