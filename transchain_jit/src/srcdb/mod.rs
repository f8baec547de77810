//! The source database: per-location translation chains and the branches
//! that enter them.

pub mod fixups;
pub mod incoming;
pub mod key;
pub mod record;

pub use fixups::{TailJumps, TranslationFixups};
pub use incoming::{BranchKind, IncomingBranch};
pub use key::{SrcKey, TransFlags};
pub use record::{SrcRec, TopTranslation};
