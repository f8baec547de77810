//! x64 backend modules.
pub mod encoder;
pub mod memory;
pub mod registers;
pub mod smash;

pub use encoder::{Condition, JCC_LEN, JMP_LEN};
pub use memory::CodeBlock;
pub use registers::Gpr;
pub use smash::X64Backend;
