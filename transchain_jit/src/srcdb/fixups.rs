//! Per-translation bookkeeping gathered while a translation is emitted.

use smallvec::SmallVec;

use super::IncomingBranch;

/// Fallback jumps of a single translation. Most translations have a handful.
pub type TailJumps = SmallVec<[IncomingBranch; 4]>;

/// Branches recorded during emission of the translation in progress.
///
/// Fallback jumps land here as they are emitted. Once the translation is
/// complete the driver hands them to
/// [`SrcRec::new_translation`](super::SrcRec::new_translation) so they can
/// be rebound when the next translation arrives.
#[derive(Debug, Default)]
pub struct TranslationFixups {
    in_progress_tail_jumps: TailJumps,
}

impl TranslationFixups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fallback jump of the translation in progress.
    #[inline]
    pub fn push_tail_jump(&mut self, br: IncomingBranch) {
        self.in_progress_tail_jumps.push(br);
    }

    #[inline]
    pub fn tail_jumps(&self) -> &[IncomingBranch] {
        &self.in_progress_tail_jumps
    }

    /// Take the recorded fallback jumps, leaving the fixups empty for the
    /// next translation.
    #[inline]
    pub fn take_tail_jumps(&mut self) -> TailJumps {
        std::mem::take(&mut self.in_progress_tail_jumps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets() {
        let mut fixups = TranslationFixups::new();
        let br = unsafe { IncomingBranch::jmp_from(0x1000 as crate::backend::Tca) };
        fixups.push_tail_jump(br);
        assert_eq!(fixups.tail_jumps(), &[br]);

        let taken = fixups.take_tail_jumps();
        assert_eq!(taken.as_slice(), &[br]);
        assert!(fixups.tail_jumps().is_empty());
    }
}
