//! Writes into live generated code.

pub mod patcher;

pub use patcher::{CACHE_LINE_SIZE, PatchStats, Patcher, within_cache_line};
