//! Moving generated code and remapping addresses that point into it.
//!
//! Relocation runs in two phases. First [`move_code`] copies ranges of a
//! block into another block and records each move in a [`RelocationInfo`].
//! Then every address holder (source records, their incoming branches)
//! asks the map where its addresses went. Addresses the map does not know
//! about are unchanged and are left alone.
//!
//! A map describes one relocation epoch. Applying it twice shifts addresses
//! that happen to land inside a moved range a second time.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::backend::{CodeBlock, Tca};
use crate::codegen::CACHE_LINE_SIZE;
use crate::error::InvariantViolation;

// =============================================================================
// Relocation Map
// =============================================================================

/// Old address to new address, or `None` when the address did not move.
pub trait RelocationMap {
    fn adjusted_address_after(&self, addr: Tca) -> Option<Tca>;
}

impl<F> RelocationMap for F
where
    F: Fn(Tca) -> Option<Tca>,
{
    #[inline]
    fn adjusted_address_after(&self, addr: Tca) -> Option<Tca> {
        self(addr)
    }
}

// =============================================================================
// Relocation Info
// =============================================================================

/// A moved range `[start, end)` now living at `dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MovedRange {
    start: usize,
    end: usize,
    dest: usize,
}

/// Records everything moved during one relocation epoch.
///
/// Individual addresses recorded with [`record_address`](Self::record_address)
/// take precedence over the ranges containing them.
#[derive(Debug, Default, Clone)]
pub struct RelocationInfo {
    ranges: Vec<MovedRange>,
    addresses: FxHashMap<usize, usize>,
}

impl RelocationInfo {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `[start, end)` was copied to `dest`.
    pub fn record_range(&mut self, start: Tca, end: Tca, dest: Tca) {
        debug_assert!(start as usize <= end as usize);
        self.ranges.push(MovedRange {
            start: start as usize,
            end: end as usize,
            dest: dest as usize,
        });
    }

    /// Record a single moved address.
    pub fn record_address(&mut self, from: Tca, to: Tca) {
        self.addresses.insert(from as usize, to as usize);
    }

    /// Whether nothing has been recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.addresses.is_empty()
    }

    /// Number of recorded ranges.
    #[inline]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

impl RelocationMap for RelocationInfo {
    fn adjusted_address_after(&self, addr: Tca) -> Option<Tca> {
        let addr = addr as usize;
        if let Some(&to) = self.addresses.get(&addr) {
            return Some(to as Tca);
        }
        self.ranges
            .iter()
            .find(|r| addr >= r.start && addr < r.end)
            .map(|r| (r.dest + (addr - r.start)) as Tca)
    }
}

// =============================================================================
// Moving Code
// =============================================================================

/// Copy the emitted bytes `[start, end)` of `src` to `dst` and record the
/// move. Returns the new address of `start`.
///
/// `dst` is first padded with NOPs so the copy keeps the same offset within
/// a cache line as the original. Smashable branches inside the range then
/// still fit one line, and address slots keep their alignment.
///
/// The source bytes are left in place: address holders decode their old
/// targets from them before repointing.
pub fn move_code(
    src: &CodeBlock,
    start: Tca,
    end: Tca,
    dst: &mut CodeBlock,
    rel: &mut RelocationInfo,
) -> Result<Tca, InvariantViolation> {
    let len = (end as usize).saturating_sub(start as usize);
    if !src.contains_emitted(start, len) {
        return Err(InvariantViolation::OutsideCodeCache { at: start as usize });
    }

    let offset = start as usize - src.base() as usize;
    let bytes = &src.as_slice()[offset..offset + len];

    let line_offset = start as usize % CACHE_LINE_SIZE;
    let pad = (line_offset + CACHE_LINE_SIZE - dst.frontier() as usize % CACHE_LINE_SIZE)
        % CACHE_LINE_SIZE;
    dst.emit_nops(pad)?;
    let dest = dst.emit_bytes(bytes)?;
    debug_assert_eq!(dest as usize % CACHE_LINE_SIZE, line_offset);
    rel.record_range(start, end, dest);

    debug!(
        from = src.name(),
        to = dst.name(),
        start = ?start,
        dest = ?dest,
        len,
        pad,
        "moved code"
    );
    Ok(dest)
}
