//! Source location keys and translation flags.
//!
//! A [`SrcKey`] names one logical program location. It travels through
//! generated code as a single `u64` immediate, so it packs to a word:
//!
//! ```text
//!  63        62 .. 32       31 .. 0
//! | resumed |  function id  | offset |
//! ```

use std::fmt;

use bitflags::bitflags;

// =============================================================================
// Source Key
// =============================================================================

/// A logical program location for which translations may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SrcKey {
    func_id: u32,
    offset: u32,
    resumed: bool,
}

impl SrcKey {
    /// Largest function id that fits in the packed form.
    pub const MAX_FUNC_ID: u32 = (1 << 31) - 1;

    const RESUMED_BIT: u64 = 1 << 63;

    /// Key for bytecode `offset` within function `func_id`.
    #[inline]
    pub const fn new(func_id: u32, offset: u32) -> Self {
        debug_assert!(func_id <= Self::MAX_FUNC_ID);
        Self {
            func_id: func_id & Self::MAX_FUNC_ID,
            offset,
            resumed: false,
        }
    }

    /// The same location, entered by resuming a suspended frame.
    #[inline]
    pub const fn resumed(self) -> Self {
        Self {
            resumed: true,
            ..self
        }
    }

    #[inline]
    pub const fn func_id(&self) -> u32 {
        self.func_id
    }

    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub const fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Pack into the word form carried by service request stubs.
    #[inline]
    pub const fn to_packed(&self) -> u64 {
        let mut word = ((self.func_id as u64) << 32) | self.offset as u64;
        if self.resumed {
            word |= Self::RESUMED_BIT;
        }
        word
    }

    /// Unpack a word produced by [`to_packed`](Self::to_packed).
    #[inline]
    pub const fn from_packed(word: u64) -> Self {
        Self {
            func_id: ((word >> 32) as u32) & Self::MAX_FUNC_ID,
            offset: word as u32,
            resumed: word & Self::RESUMED_BIT != 0,
        }
    }
}

impl fmt::Display for SrcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.func_id, self.offset)?;
        if self.resumed {
            write!(f, "r")?;
        }
        Ok(())
    }
}

// =============================================================================
// Translation Flags
// =============================================================================

bitflags! {
    /// Flags a retranslate request passes back to the compiler driver.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TransFlags: u64 {
        /// Do not inline singleton lookups in the retranslation.
        const NO_INLINE_SINGLETON = 1 << 0;
        /// The request originates from a debugger guard.
        const DEBUGGER = 1 << 1;
        /// Retranslate without profiling counters.
        const NO_PROFILE = 1 << 2;
    }
}
