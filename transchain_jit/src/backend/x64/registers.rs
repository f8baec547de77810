//! x64 registers used by emitted stubs.
//!
//! Only general-purpose registers appear in translation-cache glue: service
//! request stubs load their arguments into the first System V argument
//! registers before jumping to the request handler.

// =============================================================================
// General-Purpose Registers (GPR)
// =============================================================================

/// x64 general-purpose register with its hardware encoding.
///
/// - Bits 0-2: stored in ModR/M or the opcode byte
/// - Bit 3: stored in REX.B / REX.R
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Get bits 0-2 for opcode/ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Get bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }
}

// =============================================================================
// Service Request ABI
// =============================================================================

/// Registers carrying service request arguments into the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequestAbi {
    /// Packed source key.
    pub key: Gpr,
    /// Translation flags.
    pub flags: Gpr,
    /// Request number.
    pub request: Gpr,
}

/// Request arguments follow the first three System V integer arguments.
pub const SERVICE_REQUEST_ABI: ServiceRequestAbi = ServiceRequestAbi {
    key: Gpr::Rdi,
    flags: Gpr::Rsi,
    request: Gpr::Rdx,
};
