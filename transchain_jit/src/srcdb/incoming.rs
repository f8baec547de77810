//! Branches elsewhere in the translation cache that enter a source location.
//!
//! An [`IncomingBranch`] is a single tagged word. The kind lives in the top
//! 16 bits and the smash address in the low 48, which covers every user
//! space address on x86-64:
//!
//! ```text
//!  63      48 47                                    0
//! |  kind   |            smash address              |
//! ```

use std::fmt;

use tracing::trace;

use crate::backend::{CodeBackend, Tca};
use crate::error::InvariantViolation;
use crate::runtime::RelocationMap;

// =============================================================================
// Branch Kind
// =============================================================================

/// How an incoming branch encodes its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BranchKind {
    /// Smashable unconditional `jmp rel32`.
    Jmp = 0,
    /// Smashable conditional `jcc rel32`.
    Jcc = 1,
    /// A raw pointer-sized address word.
    Addr = 2,
}

impl BranchKind {
    /// Convert from a packed tag.
    #[inline]
    pub const fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(BranchKind::Jmp),
            1 => Some(BranchKind::Jcc),
            2 => Some(BranchKind::Addr),
            _ => None,
        }
    }

    /// Whether this kind is an instruction (as opposed to a data word).
    #[inline]
    pub const fn is_jump(self) -> bool {
        !matches!(self, BranchKind::Addr)
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchKind::Jmp => "jmp",
            BranchKind::Jcc => "jcc",
            BranchKind::Addr => "addr",
        })
    }
}

// =============================================================================
// Incoming Branch
// =============================================================================

const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// One branch that currently targets a source location.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncomingBranch {
    raw: u64,
}

impl IncomingBranch {
    #[inline]
    fn pack(kind: BranchKind, at: Tca) -> Self {
        debug_assert!(at as u64 & !ADDR_MASK == 0, "address {at:p} exceeds 48 bits");
        Self {
            raw: ((kind as u64) << ADDR_BITS) | (at as u64 & ADDR_MASK),
        }
    }

    /// A smashable `jmp` at `at`.
    ///
    /// # Safety
    /// `at` must address a live smashable jmp that stays mapped for as long
    /// as this branch is registered with a source record. Only the low 48
    /// bits of `at` are kept, so it must be a canonical user-space address
    /// (bits 48..64 clear).
    #[inline]
    pub unsafe fn jmp_from(at: Tca) -> Self {
        Self::pack(BranchKind::Jmp, at)
    }

    /// A smashable `jcc` at `at`.
    ///
    /// # Safety
    /// Same contract as [`jmp_from`](Self::jmp_from), for a jcc.
    #[inline]
    pub unsafe fn jcc_from(at: Tca) -> Self {
        Self::pack(BranchKind::Jcc, at)
    }

    /// A pointer-aligned address word at `at`.
    ///
    /// # Safety
    /// `at` must address a live, writable pointer-sized word, with bits
    /// 48..64 clear as for [`jmp_from`](Self::jmp_from).
    #[inline]
    pub unsafe fn addr_from(at: Tca) -> Self {
        Self::pack(BranchKind::Addr, at)
    }

    /// Rebuild a branch from its packed form.
    ///
    /// # Safety
    /// The packed word must describe a live branch, as for the constructors.
    pub unsafe fn from_raw(raw: u64) -> Result<Self, InvariantViolation> {
        let tag = (raw >> ADDR_BITS) as u16;
        BranchKind::from_tag(tag).ok_or(InvariantViolation::UnknownBranchKind(tag))?;
        Ok(Self { raw })
    }

    /// The packed form.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn kind(&self) -> BranchKind {
        match BranchKind::from_tag((self.raw >> ADDR_BITS) as u16) {
            Some(kind) => kind,
            // Every constructor writes a valid tag.
            None => unreachable!("corrupt incoming branch tag"),
        }
    }

    /// Address of the bytes that encode the branch.
    #[inline]
    pub fn to_smash(&self) -> Tca {
        (self.raw & ADDR_MASK) as Tca
    }

    #[inline]
    fn set_smash(&mut self, at: Tca) {
        *self = Self::pack(self.kind(), at);
    }

    /// Redirect the branch to `dest`.
    pub fn patch<B>(&self, backend: &B, dest: Tca) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        let at = self.to_smash();
        trace!(kind = %self.kind(), at = ?at, dest = ?dest, "patch incoming branch");
        // SAFETY: constructors require a live branch of this kind at `at`.
        unsafe {
            match self.kind() {
                BranchKind::Jmp => backend.smash_jmp(at, dest),
                BranchKind::Jcc => backend.smash_jcc(at, dest),
                BranchKind::Addr => backend.smash_address(at, dest),
            }
        }
    }

    /// Where the branch currently goes.
    pub fn target<B>(&self, backend: &B) -> Result<Tca, InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        let at = self.to_smash();
        // SAFETY: constructors require a live branch of this kind at `at`.
        unsafe {
            match self.kind() {
                BranchKind::Jmp => backend.jmp_target(at),
                BranchKind::Jcc => backend.jcc_target(at),
                BranchKind::Addr => backend.address_target(at),
            }
        }
    }

    /// Follow a code move.
    ///
    /// The target is decoded from the old location before anything changes,
    /// since only the old bytes are known to be intact. A jump that moved is
    /// re-encoded even if its target stayed put, because rel32 displacements
    /// depend on where the instruction sits.
    pub fn relocate<B, M>(&mut self, backend: &B, map: &M) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
        M: RelocationMap + ?Sized,
    {
        let old_target = self.target(backend)?;
        let adjusted_target = map.adjusted_address_after(old_target);

        let moved = map.adjusted_address_after(self.to_smash());
        if let Some(new_at) = moved {
            trace!(from = ?self.to_smash(), to = ?new_at, "incoming branch moved");
            self.set_smash(new_at);
        }

        let dest = match adjusted_target {
            Some(dest) => Some(dest),
            None if moved.is_some() && self.kind().is_jump() => Some(old_target),
            None => None,
        };

        if let Some(dest) = dest {
            self.patch(backend, dest)?;
        }
        Ok(())
    }
}

impl fmt::Debug for IncomingBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IncomingBranch({} @ {:p})", self.kind(), self.to_smash())
    }
}
