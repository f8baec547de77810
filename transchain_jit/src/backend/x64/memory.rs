//! Translation cache memory.
//!
//! A [`CodeBlock`] is one contiguous, page-aligned region of the translation
//! cache with an append-only frontier. Translations are emitted at the
//! frontier and never move within a block; relocation copies them to a
//! different block instead.
//!
//! # Safety
//! Blocks hand out raw addresses into their mapping. Those addresses stay
//! valid for as long as the block is alive, which is the lifetime of the
//! owning [`CodeCache`](crate::runtime::CodeCache).

use std::ptr::NonNull;

use super::encoder::{MAX_NOP_LEN, encode_nop_n};
use crate::backend::Tca;
use crate::error::InvariantViolation;

// =============================================================================
// Platform-specific imports
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
        VirtualAlloc, VirtualFree,
    };

    pub const PAGE_SIZE: usize = 4096;

    /// Reserve and commit `size` bytes.
    pub unsafe fn alloc(size: usize, executable: bool) -> *mut u8 {
        let protect = if executable {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_READWRITE
        };
        unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, protect) as *mut u8 }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Map `size` bytes of anonymous memory.
    ///
    /// Live translations are smashed while other threads execute them, so
    /// executable blocks are mapped read-write-execute for their lifetime.
    pub unsafe fn alloc(size: usize, executable: bool) -> *mut u8 {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot |= libc::PROT_EXEC;
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

pub use platform::PAGE_SIZE;

// =============================================================================
// Code Block
// =============================================================================

/// An append-only region of the translation cache.
///
/// ```text
/// base                    frontier                 base + capacity
///  |  emitted translations  |        free space          |
/// ```
pub struct CodeBlock {
    /// Name used in diagnostics (`main`, `cold`, `frozen`, ...).
    name: &'static str,
    /// Start of the mapping.
    ptr: NonNull<u8>,
    /// Total mapped size (page-aligned).
    capacity: usize,
    /// Bytes emitted so far.
    len: usize,
    /// Whether the mapping is executable.
    executable: bool,
}

impl CodeBlock {
    /// Minimum allocation size (one page).
    pub const MIN_SIZE: usize = PAGE_SIZE;

    /// Map a read-write block of at least `min_capacity` bytes.
    pub fn new(name: &'static str, min_capacity: usize) -> Option<Self> {
        Self::map(name, min_capacity, false)
    }

    /// Map a read-write-execute block of at least `min_capacity` bytes.
    pub fn new_executable(name: &'static str, min_capacity: usize) -> Option<Self> {
        Self::map(name, min_capacity, true)
    }

    fn map(name: &'static str, min_capacity: usize, executable: bool) -> Option<Self> {
        let capacity = Self::align_to_page(min_capacity.max(Self::MIN_SIZE));

        // SAFETY: a fresh anonymous mapping has no aliasing requirements.
        let ptr = unsafe { platform::alloc(capacity, executable) };
        let ptr = NonNull::new(ptr)?;

        Some(CodeBlock {
            name,
            ptr,
            capacity,
            len: 0,
            executable,
        })
    }

    /// Diagnostic name of this block.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if nothing has been emitted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total mapped size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space after the frontier.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.len
    }

    /// Whether the mapping is executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// First address of the block.
    #[inline]
    pub fn base(&self) -> Tca {
        self.ptr.as_ptr()
    }

    /// Address the next emitted byte will occupy.
    #[inline]
    pub fn frontier(&self) -> Tca {
        // SAFETY: len <= capacity, so this is at most one past the mapping.
        unsafe { self.ptr.as_ptr().add(self.len) }
    }

    /// Whether `addr` falls inside this block's mapping.
    #[inline]
    pub fn contains(&self, addr: Tca) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Whether `[start, start + len)` lies inside the emitted part of the block.
    #[inline]
    pub fn contains_emitted(&self, start: Tca, len: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let start = start as usize;
        start >= base && start.saturating_add(len) <= base + self.len
    }

    /// The emitted bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are initialized and mapped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append bytes at the frontier and return where they landed.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<Tca, InvariantViolation> {
        self.ensure_space(bytes.len())?;
        let at = self.frontier();

        // SAFETY: `ensure_space` checked the destination lies inside the
        // mapping, and the source slice cannot overlap fresh frontier bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), at, bytes.len());
        }
        self.len += bytes.len();
        Ok(at)
    }

    /// Append a single byte.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) -> Result<Tca, InvariantViolation> {
        self.emit_bytes(&[byte])
    }

    /// Append `len` bytes of multi-byte NOPs.
    pub fn emit_nops(&mut self, len: usize) -> Result<(), InvariantViolation> {
        self.ensure_space(len)?;
        let mut left = len;
        while left > 0 {
            let n = left.min(MAX_NOP_LEN);
            self.emit_bytes(encode_nop_n(n).as_slice())?;
            left -= n;
        }
        Ok(())
    }

    /// Append a pointer-aligned address word and return its slot address.
    ///
    /// Slots written this way are valid targets for address-slot branches.
    pub fn emit_address_slot(&mut self, value: Tca) -> Result<Tca, InvariantViolation> {
        let align = std::mem::align_of::<usize>();
        let pad = (align - (self.frontier() as usize % align)) % align;
        self.ensure_space(pad + std::mem::size_of::<usize>())?;
        for _ in 0..pad {
            self.emit_u8(0xCC)?;
        }
        self.emit_bytes(&(value as usize).to_ne_bytes())
    }

    fn ensure_space(&self, requested: usize) -> Result<(), InvariantViolation> {
        if requested > self.available() {
            return Err(InvariantViolation::CodeBlockFull {
                block: self.name,
                requested,
                available: self.available(),
            });
        }
        Ok(())
    }

    /// Align a size up to the nearest page boundary.
    #[inline]
    const fn align_to_page(size: usize) -> usize {
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

impl std::fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBlock")
            .field("name", &self.name)
            .field("base", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("executable", &self.executable)
            .finish()
    }
}

impl Drop for CodeBlock {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `platform::alloc` with this size.
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// SAFETY: mutation of the frontier requires `&mut self`; concurrent access
// to already-emitted bytes is the smashing protocol's responsibility.
unsafe impl Send for CodeBlock {}
unsafe impl Sync for CodeBlock {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_block_creation() {
        let block = CodeBlock::new("main", 1024).expect("Failed to allocate");
        assert!(block.capacity() >= 1024);
        assert!(block.is_empty());
        assert!(!block.is_executable());
        assert_eq!(block.base(), block.frontier());
    }

    #[test]
    fn test_emit_returns_start_address() {
        let mut block = CodeBlock::new("main", 1024).expect("Failed to allocate");

        let first = block.emit_bytes(&[0x90, 0xC3]).unwrap();
        let second = block.emit_u8(0xCC).unwrap();

        assert_eq!(first, block.base());
        assert_eq!(second as usize, block.base() as usize + 2);
        assert_eq!(block.as_slice(), &[0x90, 0xC3, 0xCC]);
    }

    #[test]
    fn test_contains() {
        let mut block = CodeBlock::new("cold", 1024).expect("Failed to allocate");
        block.emit_bytes(&[0; 16]).unwrap();

        assert!(block.contains(block.base()));
        assert!(block.contains(block.frontier()));
        assert!(block.contains_emitted(block.base(), 16));
        assert!(!block.contains_emitted(block.base(), 17));
        assert!(!block.contains(std::ptr::null_mut()));
    }

    #[test]
    fn test_emit_nops_spans_several_sequences() {
        let mut block = CodeBlock::new("main", 1024).expect("Failed to allocate");
        block.emit_nops(2 * MAX_NOP_LEN + 3).unwrap();

        assert_eq!(block.len(), 2 * MAX_NOP_LEN + 3);
        assert_eq!(&block.as_slice()[..MAX_NOP_LEN], encode_nop_n(MAX_NOP_LEN).as_slice());
        assert_eq!(&block.as_slice()[2 * MAX_NOP_LEN..], encode_nop_n(3).as_slice());

        let mut tiny = CodeBlock::new("tiny", 1).expect("Failed to allocate");
        let cap = tiny.capacity();
        assert!(tiny.emit_nops(cap + 1).is_err());
        assert!(tiny.is_empty());
    }

    #[test]
    fn test_address_slot_is_aligned() {
        let mut block = CodeBlock::new("frozen", 1024).expect("Failed to allocate");
        block.emit_u8(0x90).unwrap();

        let slot = block.emit_address_slot(0x1234 as Tca).unwrap();
        assert_eq!(slot as usize % std::mem::align_of::<usize>(), 0);
        let word_len = std::mem::size_of::<usize>();
        let word =
            usize::from_ne_bytes(block.as_slice()[block.len() - word_len..].try_into().unwrap());
        assert_eq!(word, 0x1234);
    }

    #[test]
    fn test_full_block_reports_violation() {
        let mut block = CodeBlock::new("tiny", 1).expect("Failed to allocate");
        let cap = block.capacity();
        block.emit_bytes(&vec![0x90; cap]).unwrap();

        let err = block.emit_u8(0x90).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::CodeBlockFull {
                block: "tiny",
                requested: 1,
                available: 0,
            }
        );
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(CodeBlock::align_to_page(1), PAGE_SIZE);
        assert_eq!(CodeBlock::align_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(CodeBlock::align_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
