//! x64 encodings for translation-cache control flow.
//!
//! Only the forms the chaining machinery emits or inspects live here:
//! - `jmp rel32` / `jcc rel32`, the two smashable branch shapes
//! - `mov r64, imm64` / `mov r32, imm32` for service request arguments
//! - NOP padding used to keep smashable branches inside one cache line
//!
//! # Encoding Reference
//! ```text
//! jmp rel32:  E9 <rel32>            (5 bytes)
//! jcc rel32:  0F 80+cc <rel32>      (6 bytes)
//! ```
//! `rel32` is relative to the address of the next instruction.

use super::registers::Gpr;

// =============================================================================
// REX Prefix
// =============================================================================

/// REX prefix byte.
///
/// Format: 0100WRXB
#[derive(Debug, Clone, Copy)]
pub struct Rex {
    pub w: bool, // 64-bit operand
    pub r: bool, // Extends reg in ModR/M
    pub x: bool, // Extends index in SIB
    pub b: bool, // Extends r/m in ModR/M or opcode register
}

impl Rex {
    /// Check if this REX prefix is needed (non-default bits set).
    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    /// Encode the REX prefix byte.
    #[inline]
    pub const fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }
}

// =============================================================================
// Instruction Encoder
// =============================================================================

/// Maximum encoded instruction length.
pub const MAX_INST_LEN: usize = 15;

/// Length of `jmp rel32`.
pub const JMP_LEN: usize = 5;

/// Length of `jcc rel32`.
pub const JCC_LEN: usize = 6;

/// Opcode of `jmp rel32`.
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// Escape byte preceding `jcc rel32` opcodes.
pub const TWO_BYTE_ESCAPE: u8 = 0x0F;

/// First `jcc rel32` opcode (`jo`); the low nibble is the condition.
pub const JCC_REL32_BASE: u8 = 0x80;

/// Instruction encoding buffer.
#[derive(Debug, Clone, Copy)]
pub struct EncodedInst {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl EncodedInst {
    /// Create an empty encoding buffer.
    #[inline]
    pub const fn new() -> Self {
        EncodedInst {
            bytes: [0; MAX_INST_LEN],
            len: 0,
        }
    }

    /// Get the encoded bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Get the length of the encoded instruction.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Check if empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        debug_assert!((self.len as usize) < MAX_INST_LEN);
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    fn push_u32(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    fn push_u64(&mut self, val: u64) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }
}

impl Default for EncodedInst {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Condition Codes
// =============================================================================

/// Condition codes for Jcc instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,     // JO
    NoOverflow = 0x1,   // JNO
    Below = 0x2,        // JB/JNAE/JC
    AboveEqual = 0x3,   // JAE/JNB/JNC
    Equal = 0x4,        // JE/JZ
    NotEqual = 0x5,     // JNE/JNZ
    BelowEqual = 0x6,   // JBE/JNA
    Above = 0x7,        // JA/JNBE
    Sign = 0x8,         // JS
    NoSign = 0x9,       // JNS
    Parity = 0xA,       // JP/JPE
    NoParity = 0xB,     // JNP/JPO
    Less = 0xC,         // JL/JNGE
    GreaterEqual = 0xD, // JGE/JNL
    LessEqual = 0xE,    // JLE/JNG
    Greater = 0xF,      // JG/JNLE
}

impl Condition {
    /// Recover the condition from its 4-bit encoding.
    #[inline]
    pub const fn from_nibble(cc: u8) -> Condition {
        match cc & 0xF {
            0x0 => Condition::Overflow,
            0x1 => Condition::NoOverflow,
            0x2 => Condition::Below,
            0x3 => Condition::AboveEqual,
            0x4 => Condition::Equal,
            0x5 => Condition::NotEqual,
            0x6 => Condition::BelowEqual,
            0x7 => Condition::Above,
            0x8 => Condition::Sign,
            0x9 => Condition::NoSign,
            0xA => Condition::Parity,
            0xB => Condition::NoParity,
            0xC => Condition::Less,
            0xD => Condition::GreaterEqual,
            0xE => Condition::LessEqual,
            _ => Condition::Greater,
        }
    }
}

// =============================================================================
// Control Flow
// =============================================================================

/// JMP rel32
#[inline]
pub fn encode_jmp_rel32(offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(JMP_REL32_OPCODE);
    enc.push_u32(offset as u32);
    enc
}

/// Jcc rel32 (conditional jump, 32-bit offset)
#[inline]
pub fn encode_jcc_rel32(cond: Condition, offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(TWO_BYTE_ESCAPE);
    enc.push(JCC_REL32_BASE + cond as u8);
    enc.push_u32(offset as u32);
    enc
}

/// Whether `bytes` start with a `jmp rel32` opcode.
#[inline]
pub fn is_jmp_rel32(bytes: &[u8]) -> bool {
    bytes.len() >= JMP_LEN && bytes[0] == JMP_REL32_OPCODE
}

/// Decode the condition of a `jcc rel32`, if `bytes` start with one.
#[inline]
pub fn jcc_rel32_condition(bytes: &[u8]) -> Option<Condition> {
    if bytes.len() >= JCC_LEN && bytes[0] == TWO_BYTE_ESCAPE && bytes[1] & 0xF0 == JCC_REL32_BASE
    {
        Some(Condition::from_nibble(bytes[1]))
    } else {
        None
    }
}

/// Compute a rel32 displacement from the end of an instruction at `from`
/// of length `len` to `to`. Returns `None` if it does not fit.
#[inline]
pub fn rel32_displacement(from: usize, len: usize, to: usize) -> Option<i32> {
    let next_ip = from.wrapping_add(len) as isize;
    let offset = (to as isize).wrapping_sub(next_ip);
    i32::try_from(offset).ok()
}

// =============================================================================
// Moves
// =============================================================================

/// Encode MOV r64, imm64 (REX.W + B8 + rd).
#[inline]
pub fn encode_mov_ri64(dst: Gpr, imm: i64) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex {
        w: true,
        r: false,
        x: false,
        b: dst.high_bit(),
    };
    enc.push(rex.encode());
    enc.push(0xB8 + dst.low_bits());
    enc.push_u64(imm as u64);
    enc
}

/// Encode MOV r32, imm32 (B8 + rd).
#[inline]
pub fn encode_mov_ri32(dst: Gpr, imm: u32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex {
        w: false,
        r: false,
        x: false,
        b: dst.high_bit(),
    };
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(0xB8 + dst.low_bits());
    enc.push_u32(imm);
    enc
}

// =============================================================================
// Padding and Traps
// =============================================================================

/// Recommended multi-byte NOP sequences, indexed by length - 1.
const NOP_SEQUENCES: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Longest single NOP instruction we emit.
pub const MAX_NOP_LEN: usize = NOP_SEQUENCES.len();

/// Single NOP instruction of `len` bytes (1..=9).
#[inline]
pub fn encode_nop_n(len: usize) -> EncodedInst {
    debug_assert!((1..=MAX_NOP_LEN).contains(&len));
    let mut enc = EncodedInst::new();
    for &b in NOP_SEQUENCES[len.clamp(1, MAX_NOP_LEN) - 1] {
        enc.push(b);
    }
    enc
}

/// UD2 (undefined instruction, for unreachable code)
#[inline]
pub fn encode_ud2() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x0F);
    enc.push(0x0B);
    enc
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rex_encoding() {
        let rex = Rex {
            w: true,
            r: false,
            x: false,
            b: false,
        };
        assert_eq!(rex.encode(), 0x48);
        assert!(
            !Rex {
                w: false,
                r: false,
                x: false,
                b: false
            }
            .is_needed()
        );
    }

    #[test]
    fn test_jmp_rel32() {
        let enc = encode_jmp_rel32(0x100);
        assert_eq!(enc.as_slice(), &[0xE9, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(enc.len(), JMP_LEN);
        assert!(is_jmp_rel32(enc.as_slice()));
        assert!(jcc_rel32_condition(enc.as_slice()).is_none());
    }

    #[test]
    fn test_jcc_rel32() {
        let enc = encode_jcc_rel32(Condition::NotEqual, -16);
        assert_eq!(enc.len(), JCC_LEN);
        assert_eq!(&enc.as_slice()[..2], &[0x0F, 0x85]);
        assert_eq!(jcc_rel32_condition(enc.as_slice()), Some(Condition::NotEqual));
        assert!(!is_jmp_rel32(enc.as_slice()));
    }

    #[test]
    fn test_condition_nibble_round_trip() {
        for cc in 0..16u8 {
            let cond = Condition::from_nibble(cc);
            assert_eq!(cond as u8, cc);
        }
    }

    #[test]
    fn test_rel32_displacement() {
        // Forward: 0x1100 - (0x1000 + 5)
        assert_eq!(rel32_displacement(0x1000, JMP_LEN, 0x1100), Some(0xFB));
        // Backward
        assert_eq!(rel32_displacement(0x1100, JMP_LEN, 0x1000), Some(-0x105));
        // Out of range
        assert_eq!(rel32_displacement(0, JMP_LEN, 0x1_0000_0000), None);
    }

    #[test]
    fn test_mov_immediates() {
        let enc = encode_mov_ri64(Gpr::Rdi, 0x1122_3344_5566_7788);
        assert_eq!(&enc.as_slice()[..2], &[0x48, 0xBF]);
        assert_eq!(enc.len(), 10);

        let enc = encode_mov_ri32(Gpr::Rdx, 7);
        assert_eq!(enc.as_slice(), &[0xBA, 7, 0, 0, 0]);

        let enc = encode_mov_ri32(Gpr::R10, 1);
        assert_eq!(enc.as_slice()[0], 0x41);
    }

    #[test]
    fn test_nop_lengths() {
        for len in 1..=MAX_NOP_LEN {
            assert_eq!(encode_nop_n(len).len(), len);
        }
        assert_eq!(encode_ud2().as_slice(), &[0x0F, 0x0B]);
    }
}
