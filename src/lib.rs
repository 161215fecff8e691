//! The Wasmer code management core.
//!
//! This crate re-exports the three layers it is built from:
//!
//! * [`types`]: plain data shared with code generators, such as code
//!   ranges, metadata tables, link data and tunables.
//! * [`vm`]: executable memory, cache maintenance, jump tables and the
//!   concurrent PC-to-code map.
//! * [`code`]: segments, linking, code blocks, lazy entry stubs and
//!   tiering, tied together by [`Code`](code::Code) and the
//!   [`ProcessRuntimeState`](code::ProcessRuntimeState).

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use wasmer_code as code;
pub use wasmer_code_types as types;
pub use wasmer_code_vm as vm;

pub use wasmer_code::{Code, CodeBlock, CodeGenerator, ProcessRuntimeState};
pub use wasmer_code_types::{CodeTunables, CompileError, CompileMode, Tier};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
