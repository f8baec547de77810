//! Fail-fast invariant violations.
//!
//! Nothing in this crate has a recoverable failure mode. A branch that does
//! not decode as its declared kind, a displacement that cannot reach its
//! target, or a second debugger guard all mean the translation cache is no
//! longer trustworthy. Operations report these as [`InvariantViolation`] and
//! the driver is expected to halt; [`OrFatal`] does that at the call site.

use thiserror::Error;

use crate::srcdb::BranchKind;

/// A broken translation-cache invariant.
///
/// Addresses are carried as `usize` so the error stays `Send + Sync`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// The bytes at a smash site do not encode the declared branch kind.
    #[error("branch at {at:#x} is not a smashable {expected}: found opcode bytes {found:02x?}")]
    BranchKindMismatch {
        at: usize,
        expected: BranchKind,
        found: [u8; 2],
    },

    /// A packed branch word carried a tag outside the known kinds.
    #[error("unknown incoming branch tag {0}")]
    UnknownBranchKind(u16),

    /// A rel32 branch cannot reach its target.
    #[error("branch at {at:#x} cannot reach {target:#x} with a 32-bit displacement")]
    DisplacementOutOfRange { at: usize, target: usize },

    /// An address slot that would be torn by a non-atomic store.
    #[error("address slot at {at:#x} is not pointer-aligned")]
    MisalignedAddressSlot { at: usize },

    /// A jump-kind branch registered outside the translation cache.
    #[error("branch at {at:#x} lies outside the translation cache")]
    OutsideCodeCache { at: usize },

    /// The caller allowed more translations than the configured limit.
    #[error("source record already holds {count} translations (limit {limit})")]
    TranslationLimit { count: usize, limit: usize },

    /// `add_debugger_guard` on a record that already has one.
    #[error("debugger guard already installed via branch at {guard_branch:#x}")]
    DebuggerGuardInstalled { guard_branch: usize },

    /// A source record was built without a retranslate anchor.
    #[error("source record anchor translation is null")]
    NullAnchor,

    /// A code block ran out of space.
    #[error("code block `{block}` full: requested {requested} bytes, {available} available")]
    CodeBlockFull {
        block: &'static str,
        requested: usize,
        available: usize,
    },

    /// Invalidation requested in a mode where incoming branches are long-lived.
    #[error("translation invalidation is not allowed in repo-authoritative mode without PGO")]
    InvalidationForbidden,
}

impl InvariantViolation {
    /// Log the violation and halt.
    #[cold]
    #[track_caller]
    pub fn fatal(self) -> ! {
        tracing::error!(violation = %self, "translation cache invariant violated");
        panic!("translation cache invariant violated: {self}");
    }
}

/// Turn an [`InvariantViolation`] into a process-halting panic.
pub trait OrFatal<T> {
    /// Unwrap the value or halt via [`InvariantViolation::fatal`].
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T, InvariantViolation> {
    #[inline]
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(violation) => violation.fatal(),
        }
    }
}
