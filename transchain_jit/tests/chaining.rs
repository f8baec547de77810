//! Translation chain wiring: new translations, fallback jumps, debugger
//! guards and invalidation, observed through the branches they patch.

mod common;

use common::{Fixture, init_tracing};
use transchain_jit::{
    ChainConfig, CodeBackend, Condition, IncomingBranch, InvariantViolation, RetranslateRequest,
    SrcKey, TailJumps, TransFlags, TranslationFixups,
};

// =============================================================================
// Chaining
// =============================================================================

#[test]
fn test_anchor_then_two_translations() {
    init_tracing();
    let mut fx = Fixture::new();
    let b1 = fx.chained_jmp();
    assert_eq!(fx.target(&b1), fx.anchor());

    // b2 is T1's fallback jump; it is handed over when T1 becomes the tail.
    let t1 = fx.translation();
    let b2 = fx.jmp();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::from_slice(&[b2]))
        .unwrap();
    assert_eq!(fx.target(&b1), t1);
    assert_eq!(fx.target(&b2), fx.anchor());
    assert_eq!(fx.rec.translations(), &[t1]);
    assert_eq!(fx.rec.tail_fallback_jumps(), &[b2]);

    let t2 = fx.translation();
    let b3 = fx.jmp();
    fx.rec
        .new_translation(&fx.backend, t2, TailJumps::from_slice(&[b3]))
        .unwrap();

    assert_eq!(fx.target(&b2), t2);
    assert_eq!(fx.target(&b1), t1);
    assert_eq!(fx.rec.top_translation(), t1);
    assert_eq!(fx.rec.translations(), &[t1, t2]);
    assert_eq!(fx.rec.tail_fallback_jumps(), &[b3]);
}

#[test]
fn test_chain_from_resolved_targets_top() {
    let mut fx = Fixture::new();
    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();

    let late = fx.chained_jmp();
    assert_eq!(fx.target(&late), t1);
    assert_eq!(fx.rec.incoming_branches().len(), 1);
}

#[test]
fn test_every_incoming_kind_is_rechained() {
    let mut fx = Fixture::new();
    let anchor = fx.anchor();

    let jmp = fx.chained_jmp();
    let jcc_at = fx
        .backend
        .emit_smashable_jump(fx.cache.main(), anchor, Some(Condition::Greater))
        .unwrap();
    let jcc = unsafe { IncomingBranch::jcc_from(jcc_at) };
    fx.rec.chain_from(&fx.backend, &fx.cache, jcc).unwrap();

    // Address slots may live anywhere, including outside the cache.
    let mut slot: usize = 0;
    let addr = unsafe { IncomingBranch::addr_from(&mut slot as *mut usize as *mut u8) };
    fx.rec.chain_from(&fx.backend, &fx.cache, addr).unwrap();
    assert_eq!(fx.target(&addr), anchor);

    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();

    for br in [jmp, jcc, addr] {
        assert_eq!(fx.target(&br), t1, "{br:?}");
    }
    assert_eq!(slot, t1 as usize);
}

#[test]
fn test_failed_first_translation_can_be_retried() {
    let mut fx = Fixture::new();
    let b1 = fx.chained_jmp();

    // Far beyond rel32 reach of anything in the cache.
    let far = fx.anchor().wrapping_add(1 << 40);
    let err = fx
        .rec
        .new_translation(&fx.backend, far, TailJumps::new())
        .unwrap_err();
    assert!(matches!(err, InvariantViolation::DisplacementOutOfRange { .. }));
    assert!(fx.rec.translations().is_empty());
    assert!(fx.rec.top_translation().is_null());
    assert_eq!(fx.target(&b1), fx.anchor());

    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();
    assert_eq!(fx.rec.translations(), &[t1]);
    assert_eq!(fx.rec.top_translation(), t1);
    assert_eq!(fx.target(&b1), t1);
}

#[test]
fn test_failed_later_translation_keeps_tail() {
    let mut fx = Fixture::new();
    let t1 = fx.translation();
    let tail = fx.jmp();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::from_slice(&[tail]))
        .unwrap();

    let far = fx.anchor().wrapping_add(1 << 40);
    let next_tail = fx.jmp();
    assert!(
        fx.rec
            .new_translation(&fx.backend, far, TailJumps::from_slice(&[next_tail]))
            .is_err()
    );
    assert_eq!(fx.rec.translations(), &[t1]);
    assert_eq!(fx.rec.tail_fallback_jumps(), &[tail]);
    assert_eq!(fx.target(&tail), fx.anchor());

    let t2 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t2, TailJumps::new())
        .unwrap();
    assert_eq!(fx.target(&tail), t2);
    assert_eq!(fx.rec.translations(), &[t1, t2]);
}

#[test]
fn test_jump_outside_cache_rejected() {
    let mut fx = Fixture::new();
    let mut bytes = [0xE9u8, 0, 0, 0, 0];
    let outside = unsafe { IncomingBranch::jmp_from(bytes.as_mut_ptr()) };

    let err = fx
        .rec
        .chain_from(&fx.backend, &fx.cache, outside)
        .unwrap_err();
    assert!(matches!(err, InvariantViolation::OutsideCodeCache { .. }));
    assert!(fx.rec.incoming_branches().is_empty());
}

// =============================================================================
// Fallback Jumps
// =============================================================================

#[test]
fn test_fallback_jumps_rebound_by_next_translation() {
    let mut fx = Fixture::new();
    let mut fixups = TranslationFixups::new();

    // Emitting T1: body plus two guard failures.
    let t1 = fx.translation();
    let j1 = fx
        .rec
        .emit_fallback_jump(&fx.backend, fx.cache.main(), None, &mut fixups)
        .unwrap();
    let j2 = fx
        .rec
        .emit_fallback_jump(
            &fx.backend,
            fx.cache.main(),
            Some(Condition::NotEqual),
            &mut fixups,
        )
        .unwrap();
    fx.rec
        .new_translation(&fx.backend, t1, fixups.take_tail_jumps())
        .unwrap();

    let tails: Vec<_> = fx.rec.tail_fallback_jumps().to_vec();
    assert_eq!(tails.len(), 2);
    assert_eq!(tails[0].to_smash(), j1);
    assert_eq!(tails[1].to_smash(), j2);
    for br in &tails {
        assert_eq!(fx.target(br), fx.anchor());
    }

    let t2 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t2, fixups.take_tail_jumps())
        .unwrap();
    for br in &tails {
        assert_eq!(fx.target(br), t2);
    }
    assert!(fx.rec.tail_fallback_jumps().is_empty());
}

#[test]
fn test_custom_fallback_goes_through_retranslate_stub() {
    let mut fx = Fixture::new();
    let mut fixups = TranslationFixups::new();
    let req = RetranslateRequest {
        sk: SrcKey::new(7, 32),
        flags: TransFlags::NO_INLINE_SINGLETON,
        cc: None,
    };

    let (main, _, frozen) = fx.cache.split();
    let at = fx
        .rec
        .emit_fallback_jump_custom(&fx.backend, &fx.requests, main, frozen, req, &mut fixups)
        .unwrap();

    let br = fixups.tail_jumps()[0];
    assert_eq!(br.to_smash(), at);
    let stub = fx.target(&br);
    assert_ne!(stub, fx.anchor());
    assert_eq!(fx.cache.block_for(stub), Some(transchain_jit::runtime::BlockKind::Frozen));

    // Once T2 arrives the stub is bypassed.
    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, fixups.take_tail_jumps())
        .unwrap();
    let t2 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t2, TailJumps::new())
        .unwrap();
    assert_eq!(fx.target(&br), t2);
}

// =============================================================================
// Debugger Guard
// =============================================================================

#[test]
fn test_debugger_guard_funnels_rechaining() {
    init_tracing();
    let mut fx = Fixture::new();
    let b1 = fx.chained_jmp();
    let b2 = fx.chained_jmp();

    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();

    let guard = fx.translation();
    let guard_branch = fx.jmp();
    fx.rec
        .add_debugger_guard(&fx.backend, guard, guard_branch)
        .unwrap();

    assert!(fx.rec.has_debugger_guard());
    assert_eq!(fx.rec.top_translation(), guard);
    assert_eq!(fx.target(&b1), guard);
    assert_eq!(fx.target(&b2), guard);
    // The guard branch itself is not redirected to the guard.
    assert_eq!(fx.target(&guard_branch), fx.anchor());

    // Invalidation and retranslation only touch the guard branch.
    fx.rec.replace_old_translations(&fx.backend).unwrap();
    assert_eq!(fx.target(&guard_branch), fx.anchor());
    assert_eq!(fx.target(&b1), guard);

    let t2 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t2, TailJumps::new())
        .unwrap();
    assert_eq!(fx.target(&guard_branch), t2);
    assert_eq!(fx.target(&b1), guard);
    assert_eq!(fx.target(&b2), guard);
    assert_eq!(fx.rec.top_translation(), guard);
}

#[test]
fn test_debugger_guard_before_first_translation() {
    let mut fx = Fixture::new();
    let b1 = fx.chained_jmp();

    let guard = fx.translation();
    let guard_branch = fx.jmp();
    fx.rec
        .add_debugger_guard(&fx.backend, guard, guard_branch)
        .unwrap();
    assert_eq!(fx.target(&b1), guard);

    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();
    assert_eq!(fx.target(&guard_branch), t1);
    assert_eq!(fx.target(&b1), guard);
    assert_eq!(fx.rec.top_translation(), guard);

    // Later branches enter through the guard too.
    let late = fx.chained_jmp();
    assert_eq!(fx.target(&late), guard);
}

#[test]
#[should_panic(expected = "debugger guard already installed")]
fn test_double_guard_is_fatal() {
    use transchain_jit::OrFatal;

    let mut fx = Fixture::new();
    let guard = fx.translation();
    let guard_branch = fx.jmp();
    fx.rec
        .add_debugger_guard(&fx.backend, guard, guard_branch)
        .or_fatal();
    fx.rec
        .add_debugger_guard(&fx.backend, guard, guard_branch)
        .or_fatal();
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_replace_old_translations_resets_to_anchor() {
    let mut fx = Fixture::new();
    let b1 = fx.chained_jmp();
    let t1 = fx.translation();
    let tail = fx.jmp();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::from_slice(&[tail]))
        .unwrap();
    assert_eq!(fx.target(&b1), t1);

    fx.rec.replace_old_translations(&fx.backend).unwrap();

    assert!(fx.rec.translations().is_empty());
    assert!(fx.rec.tail_fallback_jumps().is_empty());
    assert!(fx.rec.top_translation().is_null());
    assert_eq!(fx.target(&b1), fx.anchor());
    assert_eq!(fx.rec.incoming_branches(), &[b1]);

    // The record starts over: the next translation is a first translation.
    let t2 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t2, TailJumps::new())
        .unwrap();
    assert_eq!(fx.target(&b1), t2);
    assert_eq!(fx.rec.top_translation(), t2);
    // The dropped tail is no longer tracked.
    assert_eq!(fx.target(&tail), fx.anchor());
}

#[test]
fn test_replace_forbidden_leaves_state_alone() {
    let mut fx = Fixture::with_config(ChainConfig {
        repo_authoritative: true,
        ..Default::default()
    });
    let b1 = fx.chained_jmp();
    let t1 = fx.translation();
    fx.rec
        .new_translation(&fx.backend, t1, TailJumps::new())
        .unwrap();

    assert_eq!(
        fx.rec.replace_old_translations(&fx.backend),
        Err(InvariantViolation::InvalidationForbidden)
    );
    assert_eq!(fx.rec.translations(), &[t1]);
    assert_eq!(fx.target(&b1), t1);
}
