//! The translation cache.
//!
//! Generated code lives in three append-only blocks:
//! - `main`: hot translation bodies
//! - `cold`: rarely taken paths split out of translations
//! - `frozen`: stubs that are expected never to run (anchors, retranslate
//!   requests)
//!
//! Blocks are never freed while the cache is alive, so any address handed
//! out by a block stays valid for the cache's lifetime.

use tracing::debug;

use crate::backend::{CodeBlock, Tca};
use crate::config::CodeCacheConfig;

// =============================================================================
// Code Cache
// =============================================================================

/// Owner of all translation cache memory.
#[derive(Debug)]
pub struct CodeCache {
    main: CodeBlock,
    cold: CodeBlock,
    frozen: CodeBlock,
}

/// Which block an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Main,
    Cold,
    Frozen,
}

impl CodeCache {
    /// Map all blocks. Returns `None` if the OS refuses a mapping.
    pub fn new(config: &CodeCacheConfig) -> Option<Self> {
        let map = |name, size| {
            if config.executable {
                CodeBlock::new_executable(name, size)
            } else {
                CodeBlock::new(name, size)
            }
        };

        let cache = Self {
            main: map("main", config.main_size)?,
            cold: map("cold", config.cold_size)?,
            frozen: map("frozen", config.frozen_size)?,
        };
        debug!(
            main = cache.main.capacity(),
            cold = cache.cold.capacity(),
            frozen = cache.frozen.capacity(),
            executable = config.executable,
            "mapped translation cache"
        );
        Some(cache)
    }

    #[inline]
    pub fn main(&mut self) -> &mut CodeBlock {
        &mut self.main
    }

    #[inline]
    pub fn cold(&mut self) -> &mut CodeBlock {
        &mut self.cold
    }

    #[inline]
    pub fn frozen(&mut self) -> &mut CodeBlock {
        &mut self.frozen
    }

    /// Borrow two distinct blocks mutably, e.g. a body block and `frozen`
    /// for emitting a retranslate request.
    pub fn split(&mut self) -> (&mut CodeBlock, &mut CodeBlock, &mut CodeBlock) {
        (&mut self.main, &mut self.cold, &mut self.frozen)
    }

    pub fn block(&self, kind: BlockKind) -> &CodeBlock {
        match kind {
            BlockKind::Main => &self.main,
            BlockKind::Cold => &self.cold,
            BlockKind::Frozen => &self.frozen,
        }
    }

    /// The block whose mapping contains `addr`.
    pub fn block_for(&self, addr: Tca) -> Option<BlockKind> {
        [BlockKind::Main, BlockKind::Cold, BlockKind::Frozen]
            .into_iter()
            .find(|&kind| self.block(kind).contains(addr))
    }

    /// Whether `addr` lies inside any block of the cache.
    #[inline]
    pub fn is_valid_code_address(&self, addr: Tca) -> bool {
        self.block_for(addr).is_some()
    }

    /// Usage snapshot.
    pub fn stats(&self) -> CodeCacheStats {
        let usage = |cb: &CodeBlock| BlockUsage {
            used: cb.len(),
            capacity: cb.capacity(),
        };
        CodeCacheStats {
            main: usage(&self.main),
            cold: usage(&self.cold),
            frozen: usage(&self.frozen),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Bytes used in one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockUsage {
    pub used: usize,
    pub capacity: usize,
}

/// Code cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub main: BlockUsage,
    pub cold: BlockUsage,
    pub frozen: BlockUsage,
}

impl CodeCacheStats {
    /// Bytes emitted across all blocks.
    pub fn total_used(&self) -> usize {
        self.main.used + self.cold.used + self.frozen.used
    }
}
