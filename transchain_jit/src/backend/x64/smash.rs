//! Smashable branches on x64.
//!
//! A smashable branch is a `jmp rel32` or `jcc rel32` that sits entirely
//! inside one cache line. Smashing rewrites only its rel32 field, so a
//! concurrently executing thread decodes either the old target or the new
//! one, never a mix.
//!
//! ```text
//!  cache line boundary                              cache line boundary
//!  |  nop padding  | E9 | rel32 rel32 rel32 rel32 |  ...               |
//!                    ^ smash site, opcode never rewritten
//! ```

use tracing::trace;

use super::encoder::{
    self, Condition, JCC_LEN, JMP_LEN, encode_jcc_rel32, encode_jmp_rel32, rel32_displacement,
};
use super::memory::CodeBlock;
use crate::backend::{CodeBackend, Tca};
use crate::codegen::patcher::{self, CACHE_LINE_SIZE, Patcher, within_cache_line};
use crate::codegen::PatchStats;
use crate::error::InvariantViolation;
use crate::srcdb::BranchKind;

/// The x64 implementation of [`CodeBackend`].
#[derive(Debug, Default)]
pub struct X64Backend {
    patcher: Patcher,
}

impl X64Backend {
    /// Create a new backend.
    #[inline]
    pub const fn new() -> Self {
        Self {
            patcher: Patcher::new(),
        }
    }

    /// Whether an instruction of `len` bytes at `at` can be smashed atomically.
    #[inline]
    pub fn is_smashable(at: Tca, len: usize) -> bool {
        within_cache_line(at as usize, len)
    }

    fn displacement(at: Tca, len: usize, dest: Tca) -> Result<i32, InvariantViolation> {
        rel32_displacement(at as usize, len, dest as usize).ok_or(
            InvariantViolation::DisplacementOutOfRange {
                at: at as usize,
                target: dest as usize,
            },
        )
    }

    /// Decode the jmp at `at`, returning the address of its rel32 field.
    unsafe fn checked_jmp(at: Tca) -> Result<Tca, InvariantViolation> {
        // SAFETY: readable per the caller's contract.
        let bytes: [u8; JMP_LEN] = unsafe { patcher::read_bytes(at) };
        if !encoder::is_jmp_rel32(&bytes) {
            return Err(mismatch(at, BranchKind::Jmp, &bytes));
        }
        Ok(at.wrapping_add(1))
    }

    /// Decode the jcc at `at`, returning the address of its rel32 field.
    unsafe fn checked_jcc(at: Tca) -> Result<Tca, InvariantViolation> {
        // SAFETY: readable per the caller's contract.
        let bytes: [u8; JCC_LEN] = unsafe { patcher::read_bytes(at) };
        if encoder::jcc_rel32_condition(&bytes).is_none() {
            return Err(mismatch(at, BranchKind::Jcc, &bytes));
        }
        Ok(at.wrapping_add(2))
    }

    /// Resolve a rel32 field relative to the instruction end.
    unsafe fn resolve(at: Tca, len: usize, field: Tca) -> Tca {
        // SAFETY: readable per the caller's contract.
        let rel = unsafe { patcher::read_rel32(field) };
        at.wrapping_add(len).wrapping_offset(rel as isize)
    }
}

fn mismatch(at: Tca, expected: BranchKind, bytes: &[u8]) -> InvariantViolation {
    InvariantViolation::BranchKindMismatch {
        at: at as usize,
        expected,
        found: [bytes[0], bytes[1]],
    }
}

impl CodeBackend for X64Backend {
    unsafe fn smash_jmp(&self, at: Tca, dest: Tca) -> Result<(), InvariantViolation> {
        // SAFETY: forwarded caller contract.
        let field = unsafe { Self::checked_jmp(at)? };
        let disp = Self::displacement(at, JMP_LEN, dest)?;
        trace!(at = ?at, dest = ?dest, "smash jmp");
        // SAFETY: the field is inside a live branch that fits one cache line.
        unsafe { self.patcher.write_rel32(field, disp) };
        Ok(())
    }

    unsafe fn smash_jcc(&self, at: Tca, dest: Tca) -> Result<(), InvariantViolation> {
        // SAFETY: forwarded caller contract.
        let field = unsafe { Self::checked_jcc(at)? };
        let disp = Self::displacement(at, JCC_LEN, dest)?;
        trace!(at = ?at, dest = ?dest, "smash jcc");
        // SAFETY: the field is inside a live branch that fits one cache line.
        unsafe { self.patcher.write_rel32(field, disp) };
        Ok(())
    }

    unsafe fn jmp_target(&self, at: Tca) -> Result<Tca, InvariantViolation> {
        // SAFETY: forwarded caller contract.
        unsafe {
            let field = Self::checked_jmp(at)?;
            Ok(Self::resolve(at, JMP_LEN, field))
        }
    }

    unsafe fn jcc_target(&self, at: Tca) -> Result<Tca, InvariantViolation> {
        // SAFETY: forwarded caller contract.
        unsafe {
            let field = Self::checked_jcc(at)?;
            Ok(Self::resolve(at, JCC_LEN, field))
        }
    }

    unsafe fn smash_address(&self, slot: Tca, dest: Tca) -> Result<(), InvariantViolation> {
        trace!(slot = ?slot, dest = ?dest, "smash address slot");
        // SAFETY: forwarded caller contract; alignment is checked inside.
        unsafe { self.patcher.write_address_slot(slot, dest) }
    }

    unsafe fn address_target(&self, slot: Tca) -> Result<Tca, InvariantViolation> {
        // SAFETY: forwarded caller contract.
        unsafe { patcher::read_address_slot(slot) }
    }

    #[inline]
    fn smashable_len(&self, cc: Option<Condition>) -> usize {
        match cc {
            None => JMP_LEN,
            Some(_) => JCC_LEN,
        }
    }

    fn prepare_for_smash(&self, cb: &mut CodeBlock, len: usize) -> Result<(), InvariantViolation> {
        let frontier = cb.frontier() as usize;
        if within_cache_line(frontier, len) {
            return Ok(());
        }

        cb.emit_nops(CACHE_LINE_SIZE - frontier % CACHE_LINE_SIZE)
    }

    fn emit_smashable_jump(
        &self,
        cb: &mut CodeBlock,
        dest: Tca,
        cc: Option<Condition>,
    ) -> Result<Tca, InvariantViolation> {
        let len = self.smashable_len(cc);
        self.prepare_for_smash(cb, len)?;

        let from = cb.frontier();
        let disp = Self::displacement(from, len, dest)?;
        let inst = match cc {
            None => encode_jmp_rel32(disp),
            Some(cond) => encode_jcc_rel32(cond, disp),
        };
        cb.emit_bytes(inst.as_slice())
    }

    #[inline]
    fn patch_stats(&self) -> PatchStats {
        self.patcher.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
