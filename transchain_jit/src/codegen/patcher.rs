//! Low-level writes into live translation cache memory.
//!
//! Every store here may race with another thread fetching or loading the
//! same bytes, so each one is a single store that hardware cannot tear:
//!
//! 1. **rel32 fields**: an aligned `AtomicI32` store when the field is
//!    4-byte aligned; otherwise one unaligned store, which x86-64 performs
//!    atomically as long as it does not cross a cache line (guaranteed by
//!    `prepare_for_smash`).
//! 2. **Address slots**: an aligned `AtomicPtr` store. Misaligned slots are
//!    rejected rather than written.
//!
//! A release fence follows each write so a later release-store of the top
//! translation publishes the patched bytes along with it.

use std::ptr;
use std::sync::atomic::{self, AtomicI32, AtomicPtr, AtomicU64, Ordering};

use crate::backend::Tca;
use crate::error::InvariantViolation;

// =============================================================================
// Constants
// =============================================================================

/// Instruction fetch granularity that a smashable field must not straddle.
pub const CACHE_LINE_SIZE: usize = 64;

/// Whether `[addr, addr + len)` fits inside a single cache line.
#[inline]
pub fn within_cache_line(addr: usize, len: usize) -> bool {
    len <= CACHE_LINE_SIZE && addr / CACHE_LINE_SIZE == (addr + len - 1) / CACHE_LINE_SIZE
}

// =============================================================================
// Patcher
// =============================================================================

/// Performs and counts code-cache stores.
#[derive(Debug, Default)]
pub struct Patcher {
    /// rel32 displacement rewrites.
    rel32_writes: AtomicU64,
    /// Address slot rewrites.
    slot_writes: AtomicU64,
}

impl Patcher {
    /// Create a new patcher.
    #[inline]
    pub const fn new() -> Self {
        Self {
            rel32_writes: AtomicU64::new(0),
            slot_writes: AtomicU64::new(0),
        }
    }

    /// Overwrite the 4-byte displacement field at `field`.
    ///
    /// # Safety
    /// `field` must point to four writable bytes that do not cross a cache
    /// line and that no Rust reference currently aliases.
    #[inline]
    pub unsafe fn write_rel32(&self, field: Tca, value: i32) {
        debug_assert!(within_cache_line(field as usize, 4));

        if (field as usize) % std::mem::align_of::<i32>() == 0 {
            // SAFETY: aligned, valid for writes per the caller's contract.
            let atom = unsafe { AtomicI32::from_ptr(field as *mut i32) };
            atom.store(value, Ordering::Release);
        } else {
            // SAFETY: valid for writes; a single store inside one cache line.
            unsafe { ptr::write_unaligned(field as *mut i32, value) };
            atomic::fence(Ordering::Release);
        }

        self.rel32_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Store `dest` into the address word at `slot`.
    ///
    /// # Safety
    /// `slot` must point to a writable, pointer-sized word.
    #[inline]
    pub unsafe fn write_address_slot(&self, slot: Tca, dest: Tca) -> Result<(), InvariantViolation> {
        let word = checked_slot(slot)?;
        // SAFETY: alignment checked above; validity is the caller's contract.
        let atom = unsafe { AtomicPtr::from_ptr(word) };
        atom.store(dest, Ordering::Release);

        self.slot_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get patch statistics.
    #[inline]
    pub fn stats(&self) -> PatchStats {
        PatchStats {
            rel32_writes: self.rel32_writes.load(Ordering::Relaxed),
            slot_writes: self.slot_writes.load(Ordering::Relaxed),
        }
    }
}

/// Patch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Total rel32 displacement rewrites.
    pub rel32_writes: u64,
    /// Total address slot rewrites.
    pub slot_writes: u64,
}

impl PatchStats {
    /// Total stores into the translation cache.
    #[inline]
    pub fn total(&self) -> u64 {
        self.rel32_writes + self.slot_writes
    }
}

// =============================================================================
// Reads
// =============================================================================

/// Read the 4-byte displacement field at `field`.
///
/// # Safety
/// `field` must point to four readable bytes.
#[inline]
pub unsafe fn read_rel32(field: Tca) -> i32 {
    // SAFETY: readable per the caller's contract.
    unsafe { ptr::read_unaligned(field as *const i32) }
}

/// Read the address word at `slot`.
///
/// # Safety
/// `slot` must point to a readable, pointer-sized word.
#[inline]
pub unsafe fn read_address_slot(slot: Tca) -> Result<Tca, InvariantViolation> {
    let word = checked_slot(slot)?;
    // SAFETY: alignment checked above; validity is the caller's contract.
    let atom = unsafe { AtomicPtr::from_ptr(word) };
    Ok(atom.load(Ordering::Acquire))
}

/// Copy `N` bytes starting at `at`.
///
/// # Safety
/// `at` must point to `N` readable bytes.
#[inline]
pub unsafe fn read_bytes<const N: usize>(at: Tca) -> [u8; N] {
    let mut out = [0u8; N];
    // SAFETY: readable per the caller's contract; `out` is a fresh local.
    unsafe { ptr::copy_nonoverlapping(at as *const u8, out.as_mut_ptr(), N) };
    out
}

#[inline]
fn checked_slot(slot: Tca) -> Result<*mut Tca, InvariantViolation> {
    if (slot as usize) % std::mem::align_of::<Tca>() != 0 {
        return Err(InvariantViolation::MisalignedAddressSlot { at: slot as usize });
    }
    Ok(slot as *mut Tca)
}

// =============================================================================
// Tests
// =============================================================================
