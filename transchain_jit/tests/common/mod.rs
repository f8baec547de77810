//! Shared fixtures for integration tests.
#![allow(dead_code)]

use transchain_jit::backend::x64::encoder::encode_ud2;
use transchain_jit::{
    ChainConfig, CodeBackend, CodeCache, CodeCacheConfig, IncomingBranch, ServiceRequests, SrcKey,
    SrcRec, Tca, X64Backend,
};

/// A code cache, a backend and one source record anchored in `frozen`.
pub struct Fixture {
    pub backend: X64Backend,
    pub cache: CodeCache,
    pub requests: ServiceRequests,
    pub rec: SrcRec,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        let mut cache = CodeCache::new(&CodeCacheConfig::for_testing()).expect("Failed to map");
        let handler = cache
            .frozen()
            .emit_bytes(encode_ud2().as_slice())
            .expect("handler");
        let requests = ServiceRequests::new(handler);
        let anchor = requests
            .emit_anchor(cache.frozen(), SrcKey::new(7, 32))
            .expect("anchor");
        let rec = SrcRec::new(anchor, &config).expect("record");

        Self {
            backend: X64Backend::new(),
            cache,
            requests,
            rec,
        }
    }

    pub fn anchor(&self) -> Tca {
        self.rec.anchor_translation()
    }

    /// Emit a stand-in translation body in `main`.
    pub fn translation(&mut self) -> Tca {
        self.cache.main().emit_bytes(&[0x90; 24]).expect("translation")
    }

    /// Emit a jmp in `main` pointing at the anchor.
    pub fn jmp(&mut self) -> IncomingBranch {
        let anchor = self.anchor();
        let at = self
            .backend
            .emit_smashable_jump(self.cache.main(), anchor, None)
            .expect("jmp");
        unsafe { IncomingBranch::jmp_from(at) }
    }

    /// Register a fresh jmp as an incoming branch.
    pub fn chained_jmp(&mut self) -> IncomingBranch {
        let br = self.jmp();
        self.rec
            .chain_from(&self.backend, &self.cache, br)
            .expect("chain_from");
        br
    }

    pub fn target(&self, br: &IncomingBranch) -> Tca {
        br.target(&self.backend).expect("target")
    }
}

/// Route `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}
