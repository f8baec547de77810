//! Service request stubs.
//!
//! Generated code that cannot proceed on its own jumps to a stub that loads
//! the request arguments and enters the runtime's request handler. The only
//! request source records need is `Retranslate`: "compile this location
//! again". Every source record's anchor is such a stub.
//!
//! Stub layout (frozen block):
//!
//! ```text
//! mov rdi, imm64      ; packed SrcKey
//! mov rsi, imm64      ; TransFlags bits
//! mov edx, imm32      ; request number
//! jmp rel32 handler
//! ```

use tracing::debug;

use crate::backend::x64::encoder::{
    JMP_LEN, encode_jmp_rel32, encode_mov_ri32, encode_mov_ri64, rel32_displacement,
};
use crate::backend::x64::registers::SERVICE_REQUEST_ABI;
use crate::backend::{CodeBackend, CodeBlock, Condition, Tca};
use crate::codegen::patcher;
use crate::error::InvariantViolation;
use crate::srcdb::{SrcKey, TransFlags};

// =============================================================================
// Service Request
// =============================================================================

/// Requests generated code can make of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceRequest {
    /// Compile a new translation for the carried source key.
    Retranslate = 1,
}

impl ServiceRequest {
    /// Convert from the raw request number.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ServiceRequest::Retranslate),
            _ => None,
        }
    }
}

/// Arguments of a retranslate stub emitted for a fallback jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetranslateRequest {
    pub sk: SrcKey,
    pub flags: TransFlags,
    /// Condition of the jump into the stub; `None` for an unconditional jmp.
    pub cc: Option<Condition>,
}

/// A stub read back from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedStub {
    pub request: ServiceRequest,
    pub sk: SrcKey,
    pub flags: TransFlags,
    pub handler: Tca,
}

// Fixed stub geometry.
const MOV_RI64_LEN: usize = 10;
const MOV_RI32_LEN: usize = 5;
const KEY_IMM_OFFSET: usize = 2;
const FLAGS_IMM_OFFSET: usize = MOV_RI64_LEN + 2;
const REQUEST_IMM_OFFSET: usize = 2 * MOV_RI64_LEN + 1;
const JMP_OFFSET: usize = 2 * MOV_RI64_LEN + MOV_RI32_LEN;

/// Total length of a request stub.
pub const STUB_LEN: usize = JMP_OFFSET + JMP_LEN;

// =============================================================================
// Emitter
// =============================================================================

/// Emits service request stubs that enter `handler`.
#[derive(Debug, Clone, Copy)]
pub struct ServiceRequests {
    handler: Tca,
}

// SAFETY: `handler` is an address in the translation cache; nothing is
// dereferenced through it here.
unsafe impl Send for ServiceRequests {}
unsafe impl Sync for ServiceRequests {}

impl ServiceRequests {
    /// Create an emitter for stubs jumping to `handler`.
    pub fn new(handler: Tca) -> Self {
        Self { handler }
    }

    #[inline]
    pub fn handler(&self) -> Tca {
        self.handler
    }

    fn emit_stub(
        &self,
        frozen: &mut CodeBlock,
        request: ServiceRequest,
        sk: SrcKey,
        flags: TransFlags,
    ) -> Result<Tca, InvariantViolation> {
        let abi = SERVICE_REQUEST_ABI;
        let start = frozen.frontier();
        let jmp_at = start.wrapping_add(JMP_OFFSET);
        let disp = rel32_displacement(jmp_at as usize, JMP_LEN, self.handler as usize).ok_or(
            InvariantViolation::DisplacementOutOfRange {
                at: jmp_at as usize,
                target: self.handler as usize,
            },
        )?;

        let mut bytes = Vec::with_capacity(STUB_LEN);
        bytes.extend_from_slice(encode_mov_ri64(abi.key, sk.to_packed() as i64).as_slice());
        bytes.extend_from_slice(encode_mov_ri64(abi.flags, flags.bits() as i64).as_slice());
        bytes.extend_from_slice(encode_mov_ri32(abi.request, request as u32).as_slice());
        bytes.extend_from_slice(encode_jmp_rel32(disp).as_slice());
        debug_assert_eq!(bytes.len(), STUB_LEN);

        frozen.emit_bytes(&bytes)
    }

    /// Emit the anchor stub for `sk` and return its entry.
    pub fn emit_anchor(&self, frozen: &mut CodeBlock, sk: SrcKey) -> Result<Tca, InvariantViolation> {
        let anchor = self.emit_stub(frozen, ServiceRequest::Retranslate, sk, TransFlags::empty())?;
        debug!(sk = %sk, anchor = ?anchor, "emitted anchor");
        Ok(anchor)
    }

    /// Emit a retranslate stub in `frozen` and a smashable branch to it in
    /// `cb`. Returns the address of the smashable branch.
    pub fn emit_retranslate<B>(
        &self,
        backend: &B,
        cb: &mut CodeBlock,
        frozen: &mut CodeBlock,
        req: RetranslateRequest,
    ) -> Result<Tca, InvariantViolation>
    where
        B: CodeBackend + ?Sized,
    {
        let stub = self.emit_stub(frozen, ServiceRequest::Retranslate, req.sk, req.flags)?;
        let branch = backend.emit_smashable_jump(cb, stub, req.cc)?;
        debug!(sk = %req.sk, flags = ?req.flags, stub = ?stub, branch = ?branch, "emitted retranslate");
        Ok(branch)
    }

    /// Read back the stub at `at`.
    ///
    /// # Safety
    /// `at` must address [`STUB_LEN`] readable bytes.
    pub unsafe fn decode_stub(at: Tca) -> Option<DecodedStub> {
        // SAFETY: readable per the caller's contract.
        let bytes: [u8; STUB_LEN] = unsafe { patcher::read_bytes(at) };

        let abi = SERVICE_REQUEST_ABI;
        let expected_heads = [
            (0, encode_mov_ri64(abi.key, 0)),
            (MOV_RI64_LEN, encode_mov_ri64(abi.flags, 0)),
            (2 * MOV_RI64_LEN, encode_mov_ri32(abi.request, 0)),
            (JMP_OFFSET, encode_jmp_rel32(0)),
        ];
        for (offset, head) in &expected_heads {
            let op_len = head.len() - if *offset < 2 * MOV_RI64_LEN { 8 } else { 4 };
            if bytes[*offset..*offset + op_len] != head.as_slice()[..op_len] {
                return None;
            }
        }

        let word = |off: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(w)
        };
        let dword = |off: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[off..off + 4]);
            u32::from_le_bytes(w)
        };

        let request = ServiceRequest::from_u32(dword(REQUEST_IMM_OFFSET))?;
        let rel = dword(JMP_OFFSET + 1) as i32;
        let handler = at.wrapping_add(STUB_LEN).wrapping_offset(rel as isize);

        Some(DecodedStub {
            request,
            sk: SrcKey::from_packed(word(KEY_IMM_OFFSET)),
            flags: TransFlags::from_bits_retain(word(FLAGS_IMM_OFFSET)),
            handler,
        })
    }
}
