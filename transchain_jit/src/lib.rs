//! Translation chaining and relocation for a JIT translation cache.
//!
//! Each source location may accumulate several translations over a run.
//! This crate tracks them per location and keeps every branch that enters
//! a location pointed at the right one, by smashing live code in place:
//! - `srcdb`: source records, incoming branches, fallback-jump fixups
//! - `backend`: smashable x64 branches over append-only code blocks
//! - `codegen`: atomic stores into executing code
//! - `runtime`: the code cache, retranslate stubs, code relocation
#![deny(unsafe_op_in_unsafe_fn)]
pub mod backend;
pub mod codegen;
pub mod config;
pub mod error;
pub mod runtime;
pub mod srcdb;

pub use backend::{CodeBackend, CodeBlock, Condition, Tca, X64Backend};
pub use config::{ChainConfig, CodeCacheConfig};
pub use error::{InvariantViolation, OrFatal};
pub use runtime::{
    CodeCache, RelocationInfo, RelocationMap, RetranslateRequest, ServiceRequests, move_code,
};
pub use srcdb::{
    BranchKind, IncomingBranch, SrcKey, SrcRec, TailJumps, TopTranslation, TransFlags,
    TranslationFixups,
};
