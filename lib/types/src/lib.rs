//! Common types of the Wasmer code management core.
//!
//! This crate holds the plain data that flows between the code generator and
//! the code management layer: index types, code ranges and the offset-keyed
//! metadata tables of a block of machine code, link data, tiers and the
//! tunables that control code placement.

#![deny(missing_docs, unused_extern_crates)]
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

pub mod entity;
pub mod error;

mod code_range;
mod compiled;
mod indexes;
mod link_data;
mod metadata;
mod module;
mod tier;
mod trapcode;
mod tunables;
mod types;

pub use crate::code_range::{lookup_code_range, CodeRange, CodeRangeKind, CodeRangeKindTag};
pub use crate::compiled::{CompiledCode, EntryStubRequest};
pub use crate::error::{CodeMemoryError, CompileError, ScheduleError};
pub use crate::indexes::{CodeBlockIndex, CodeRangeIndex, FunctionIndex};
pub use crate::link_data::{
    FarJump, InternalLink, LinkData, RelocationKind, SymbolicAddress, INTERNAL_PLACEHOLDER,
    SYMBOLIC_PLACEHOLDER,
};
pub use crate::metadata::{
    CallSite, CallSiteKind, CodeMetadata, CodeRangeUnwindInfo, FuncExport, StackMap, TrapSite,
    TryNote, UnwindHow,
};
pub use crate::module::ModuleMetadata;
pub use crate::tier::{CompileMode, Tier, TierUpState};
pub use crate::trapcode::TrapCode;
pub use crate::tunables::{CodeTunables, CODE_ALIGNMENT, EXECUTABLE_CODE_PAGE_SIZE};
pub use crate::types::{FunctionType, Type};

pub use enumset::EnumSet;

/// Offset in bytes from the beginning of a code segment.
pub type CodeOffset = u32;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
