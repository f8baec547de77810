//! Per-source-location translation chains.
//!
//! A [`SrcRec`] tracks every translation produced for one source location
//! and every branch in the cache that enters it. Translations form a chain:
//!
//! ```text
//!  incoming branches ──► T1 ──fallback──► T2 ──fallback──► T3 ──fallback──► anchor
//!                        ▲                                                (retranslate)
//!                        └── top translation
//! ```
//!
//! Each translation's fallback jumps are emitted pointing at the anchor and
//! rebound exactly once, when the next translation is appended. Incoming
//! branches always point at the top translation, or at the debugger guard
//! when one is installed.
//!
//! # Concurrency
//!
//! All mutation happens under the caller's write lease. Executing threads
//! only ever read [`TopTranslation`] (acquire) and the branch bytes the
//! record has patched. Branch patches complete before the top translation
//! is published with release ordering, so a thread that observes the new
//! top also observes every branch rechained to it.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::{debug, trace};

use super::{IncomingBranch, TailJumps, TranslationFixups};
use crate::backend::{CodeBackend, CodeBlock, Condition, Tca};
use crate::config::ChainConfig;
use crate::error::InvariantViolation;
use crate::runtime::{CodeCache, RelocationMap, RetranslateRequest, ServiceRequests};

// =============================================================================
// Top Translation
// =============================================================================

/// The preferred entry of a source location, readable without the lease.
///
/// Null means no translation is available yet.
#[derive(Debug, Default)]
pub struct TopTranslation {
    ptr: AtomicPtr<u8>,
}

impl TopTranslation {
    /// Current entry, or null.
    #[inline]
    pub fn load(&self) -> Tca {
        self.ptr.load(Ordering::Acquire)
    }

    #[inline]
    fn publish(&self, entry: Tca) {
        self.ptr.store(entry, Ordering::Release);
    }

    #[inline]
    fn clear(&self) {
        self.publish(ptr::null_mut());
    }
}

// =============================================================================
// Source Record
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct DebuggerGuard {
    /// Entry of the guard code that now fronts this location.
    guard: Tca,
    /// The one branch inside the guard that leads on to the translations.
    branch: IncomingBranch,
}

/// Translation chain for one source location.
#[derive(Debug)]
pub struct SrcRec {
    config: ChainConfig,
    anchor: Tca,
    top: Arc<TopTranslation>,
    translations: Vec<Tca>,
    incoming_branches: Vec<IncomingBranch>,
    tail_fallback_jumps: TailJumps,
    debugger_guard: Option<DebuggerGuard>,
}

// SAFETY: the raw addresses point into the translation cache. Mutation
// requires `&mut self`, and the only field shared with executing threads is
// the atomic top translation.
unsafe impl Send for SrcRec {}
unsafe impl Sync for SrcRec {}

impl SrcRec {
    /// Create a record whose fallback is the retranslate stub at `anchor`.
    pub fn new(anchor: Tca, config: &ChainConfig) -> Result<Self, InvariantViolation> {
        if anchor.is_null() {
            return Err(InvariantViolation::NullAnchor);
        }
        Ok(Self {
            config: *config,
            anchor,
            top: Arc::default(),
            translations: Vec::new(),
            incoming_branches: Vec::new(),
            tail_fallback_jumps: TailJumps::new(),
            debugger_guard: None,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Preferred entry, or null if nothing has been translated.
    #[inline]
    pub fn top_translation(&self) -> Tca {
        self.top.load()
    }

    /// Shared handle for threads that read the top translation lock-free.
    #[inline]
    pub fn top_translation_handle(&self) -> Arc<TopTranslation> {
        Arc::clone(&self.top)
    }

    #[inline]
    pub fn anchor_translation(&self) -> Tca {
        self.anchor
    }

    /// Where a translation being emitted jumps when its checks fail.
    ///
    /// New translations are appended to the end of the chain, so the
    /// fallback of the translation in progress is always the anchor. Its
    /// fallback jumps are rebound when the next translation arrives.
    #[inline]
    pub fn fallback_translation(&self) -> Tca {
        debug_assert!(!self.anchor.is_null());
        self.anchor
    }

    #[inline]
    pub fn has_debugger_guard(&self) -> bool {
        self.debugger_guard.is_some()
    }

    /// Entry of the installed debugger guard.
    #[inline]
    pub fn debugger_guard(&self) -> Option<Tca> {
        self.debugger_guard.map(|g| g.guard)
    }

    #[inline]
    pub fn translations(&self) -> &[Tca] {
        &self.translations
    }

    #[inline]
    pub fn incoming_branches(&self) -> &[IncomingBranch] {
        &self.incoming_branches
    }

    #[inline]
    pub fn tail_fallback_jumps(&self) -> &[IncomingBranch] {
        &self.tail_fallback_jumps
    }

    #[inline]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    // =========================================================================
    // Chaining
    // =========================================================================

    /// Append the translation at `new_start`.
    ///
    /// The first translation becomes the top and every incoming branch is
    /// rechained to it. Later translations are reached through the fallback
    /// jumps of the previous tail. `tail` holds the new translation's own
    /// fallback jumps, which replace the previous tail set.
    ///
    /// On error the record is unchanged. Branches smashed before the failing
    /// one keep pointing at `new_start`.
    pub fn new_translation<B>(
        &mut self,
        backend: &B,
        new_start: Tca,
        tail: TailJumps,
    ) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        // The driver stops at the limit and then emits one more translation
        // that interprets.
        if self.translations.len() > self.config.max_translations {
            return Err(InvariantViolation::TranslationLimit {
                count: self.translations.len(),
                limit: self.config.max_translations,
            });
        }

        debug!(
            rec = ?(self as *const Self),
            start = ?new_start,
            count = self.translations.len() + 1,
            tail = tail.len(),
            "new translation"
        );

        let unresolved = self.translations.is_empty();
        if unresolved {
            self.patch_incoming_branches(backend, new_start)?;
        }

        // Someone may be running the old tail while this happens. They reach
        // either the anchor or the new translation, and both are valid.
        for br in &self.tail_fallback_jumps {
            br.patch(backend, new_start)?;
        }

        // Record state changes only after every smash has landed.
        self.translations.push(new_start);
        self.tail_fallback_jumps = tail;
        if unresolved {
            let top = self.debugger_guard.map_or(new_start, |g| g.guard);
            self.top.publish(top);
        }
        Ok(())
    }

    /// Register `br` as entering this location and point it at the top
    /// translation, or the anchor while nothing is translated.
    ///
    /// Address-slot branches may live outside the cache; jumps may not.
    pub fn chain_from<B>(
        &mut self,
        backend: &B,
        cache: &CodeCache,
        br: IncomingBranch,
    ) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        if br.kind().is_jump() && !cache.is_valid_code_address(br.to_smash()) {
            return Err(InvariantViolation::OutsideCodeCache {
                at: br.to_smash() as usize,
            });
        }

        let top = self.top.load();
        let dest = if top.is_null() { self.anchor } else { top };
        br.patch(backend, dest)?;
        self.incoming_branches.push(br);

        debug!(
            rec = ?(self as *const Self),
            branch = ?br,
            dest = ?dest,
            incoming = self.incoming_branches.len(),
            "chain from"
        );
        Ok(())
    }

    // =========================================================================
    // Fallback Jumps
    // =========================================================================

    /// Emit a smashable jump (or jcc) to the fallback translation and record
    /// it in `fixups` as a tail jump of the translation in progress.
    pub fn emit_fallback_jump<B>(
        &self,
        backend: &B,
        cb: &mut CodeBlock,
        cc: Option<Condition>,
        fixups: &mut TranslationFixups,
    ) -> Result<Tca, InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        backend.prepare_for_smash(cb, backend.smashable_len(cc))?;
        let from = cb.frontier();
        let at = backend.emit_smashable_jump(cb, self.fallback_translation(), cc)?;
        debug_assert_eq!(at, from);

        // SAFETY: just emitted a smashable branch of this kind at `at`.
        unsafe { self.register_fallback_jump(fixups, at, cc) };
        Ok(at)
    }

    /// Emit a retranslate request for `req` and record the branch into it
    /// as a tail jump. Used where a plain fallback jump does not fit.
    pub fn emit_fallback_jump_custom<B>(
        &self,
        backend: &B,
        requests: &ServiceRequests,
        cb: &mut CodeBlock,
        frozen: &mut CodeBlock,
        req: RetranslateRequest,
        fixups: &mut TranslationFixups,
    ) -> Result<Tca, InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        let at = requests.emit_retranslate(backend, cb, frozen, req)?;

        // SAFETY: `emit_retranslate` returns a smashable branch of kind `req.cc`.
        unsafe { self.register_fallback_jump(fixups, at, req.cc) };
        Ok(at)
    }

    /// Record the fallback jump at `from` so it can be rebound to the next
    /// translation in the chain.
    ///
    /// # Safety
    /// `from` must address a live smashable jmp (`cc == None`) or jcc.
    pub unsafe fn register_fallback_jump(
        &self,
        fixups: &mut TranslationFixups,
        from: Tca,
        cc: Option<Condition>,
    ) {
        // SAFETY: forwarded caller contract.
        let br = unsafe {
            match cc {
                None => IncomingBranch::jmp_from(from),
                Some(_) => IncomingBranch::jcc_from(from),
            }
        };
        trace!(rec = ?(self as *const Self), branch = ?br, "register fallback jump");
        fixups.push_tail_jump(br);
    }

    // =========================================================================
    // Debugger Guard
    // =========================================================================

    /// Front this location with debugger guard code at `guard`.
    ///
    /// Every incoming branch is rechained to `guard`; from then on only
    /// `guard_branch` (the guard's own exit into the translations) is
    /// patched when the chain changes.
    pub fn add_debugger_guard<B>(
        &mut self,
        backend: &B,
        guard: Tca,
        guard_branch: IncomingBranch,
    ) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        if let Some(existing) = self.debugger_guard {
            return Err(InvariantViolation::DebuggerGuardInstalled {
                guard_branch: existing.branch.to_smash() as usize,
            });
        }

        debug!(
            rec = ?(self as *const Self),
            guard = ?guard,
            incoming = self.incoming_branches.len(),
            "add debugger guard"
        );

        // Patch before the guard is marked active, otherwise only the guard
        // branch itself would be redirected to the guard.
        self.patch_incoming_branches(backend, guard)?;

        self.debugger_guard = Some(DebuggerGuard {
            guard,
            branch: guard_branch,
        });
        self.top.publish(guard);
        Ok(())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop every translation and send all incoming traffic to the anchor.
    ///
    /// Incoming branches are not rebound to anything smarter: invalidation
    /// only runs where code is torn down in units small enough that those
    /// branches are about to disappear too. A thread that was mid-way into
    /// a retranslate may still produce a duplicate of a translation made
    /// after this call.
    pub fn replace_old_translations<B>(&mut self, backend: &B) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        if !self.config.allows_invalidation() {
            return Err(InvariantViolation::InvalidationForbidden);
        }

        debug!(
            rec = ?(self as *const Self),
            dropped = self.translations.len(),
            incoming = self.incoming_branches.len(),
            "replace old translations"
        );

        self.translations.clear();
        self.tail_fallback_jumps.clear();
        self.top.clear();

        self.patch_incoming_branches(backend, self.anchor)
    }

    // =========================================================================
    // Relocation
    // =========================================================================

    /// Rewrite every address held by this record after a code move.
    ///
    /// Nothing is committed until every branch has been relocated. A failed
    /// call leaves the record on its old addresses, which stay decodable
    /// because moved code keeps its source bytes.
    pub fn relocate<B, M>(&mut self, backend: &B, map: &M) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
        M: RelocationMap + ?Sized,
    {
        let adjust = |addr: Tca| map.adjusted_address_after(addr).unwrap_or(addr);

        let anchor = adjust(self.anchor);
        let top = self.top.load();
        let moved_top = if top.is_null() {
            None
        } else {
            map.adjusted_address_after(top)
        };
        let translations: Vec<Tca> = self.translations.iter().map(|&t| adjust(t)).collect();

        let mut tail = self.tail_fallback_jumps.clone();
        for br in &mut tail {
            br.relocate(backend, map)?;
        }

        let mut incoming = self.incoming_branches.clone();
        for br in &mut incoming {
            br.relocate(backend, map)?;
        }

        let debugger_guard = match self.debugger_guard {
            Some(mut g) => {
                g.guard = adjust(g.guard);
                g.branch.relocate(backend, map)?;
                Some(g)
            }
            None => None,
        };

        self.anchor = anchor;
        self.translations = translations;
        self.tail_fallback_jumps = tail;
        self.incoming_branches = incoming;
        self.debugger_guard = debugger_guard;
        if let Some(top) = moved_top {
            self.top.publish(top);
        }

        trace!(rec = ?(self as *const Self), top = ?self.top.load(), "relocated");
        Ok(())
    }

    /// Point every way into this location at `dest`. With a debugger guard
    /// installed all entries funnel through the guard, so only its branch
    /// is smashed.
    fn patch_incoming_branches<B>(&self, backend: &B, dest: Tca) -> Result<(), InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        if let Some(g) = &self.debugger_guard {
            trace!(branch = ?g.branch, dest = ?dest, "smash debugger guard branch");
            return g.branch.patch(backend, dest);
        }

        trace!(count = self.incoming_branches.len(), dest = ?dest, "rechain incoming branches");
        for br in &self.incoming_branches {
            br.patch(backend, dest)?;
        }
        Ok(())
    }
}
