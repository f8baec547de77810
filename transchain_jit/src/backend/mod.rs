//! Code generation backends for the translation cache.
//!
//! The chaining machinery never looks at instruction bytes itself. It goes
//! through [`CodeBackend`], which knows how a smashable branch is laid out
//! on the host architecture:
//! - `x64`: `jmp rel32` / `jcc rel32` smashing (the only backend so far)

pub mod x64;

use crate::codegen::PatchStats;
use crate::error::InvariantViolation;

pub use x64::{CodeBlock, Condition, X64Backend};

/// An address inside (or, for address slots, referenced from) the
/// translation cache.
pub type Tca = *mut u8;

/// Architecture contract for smashable branches.
///
/// Implementations must guarantee that after a smash returns, the matching
/// target read at the same address yields the new destination, and that a
/// smash never changes instruction length or opcode bytes.
pub trait CodeBackend {
    /// Redirect the unconditional jump at `at` to `dest`.
    ///
    /// # Safety
    /// `at` must address a live, writable branch emitted by this backend.
    unsafe fn smash_jmp(&self, at: Tca, dest: Tca) -> Result<(), InvariantViolation>;

    /// Redirect the conditional jump at `at` to `dest`, keeping its condition.
    ///
    /// # Safety
    /// `at` must address a live, writable branch emitted by this backend.
    unsafe fn smash_jcc(&self, at: Tca, dest: Tca) -> Result<(), InvariantViolation>;

    /// Current destination of the unconditional jump at `at`.
    ///
    /// # Safety
    /// `at` must address readable instruction bytes.
    unsafe fn jmp_target(&self, at: Tca) -> Result<Tca, InvariantViolation>;

    /// Current destination of the conditional jump at `at`.
    ///
    /// # Safety
    /// `at` must address readable instruction bytes.
    unsafe fn jcc_target(&self, at: Tca) -> Result<Tca, InvariantViolation>;

    /// Store `dest` into the pointer-aligned address word at `slot`.
    ///
    /// # Safety
    /// `slot` must address a live, writable pointer-sized word.
    unsafe fn smash_address(&self, slot: Tca, dest: Tca) -> Result<(), InvariantViolation>;

    /// Current contents of the address word at `slot`.
    ///
    /// # Safety
    /// `slot` must address a readable pointer-sized word.
    unsafe fn address_target(&self, slot: Tca) -> Result<Tca, InvariantViolation>;

    /// Encoded length of a smashable jump (`cc == None`) or jcc.
    fn smashable_len(&self, cc: Option<Condition>) -> usize;

    /// Pad `cb` so that the next `len` bytes can be smashed atomically.
    fn prepare_for_smash(&self, cb: &mut CodeBlock, len: usize) -> Result<(), InvariantViolation>;

    /// Emit a smashable jmp or jcc to `dest` and return its address.
    fn emit_smashable_jump(
        &self,
        cb: &mut CodeBlock,
        dest: Tca,
        cc: Option<Condition>,
    ) -> Result<Tca, InvariantViolation>;

    /// Counters for stores made through this backend.
    fn patch_stats(&self) -> PatchStats;
}
