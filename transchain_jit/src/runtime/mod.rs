//! Runtime support around the translation cache: its memory, the service
//! request stubs generated code falls back to, and code relocation.

pub mod code_cache;
pub mod relocation;
pub mod service_request;

pub use code_cache::{BlockKind, CodeCache, CodeCacheStats};
pub use relocation::{RelocationInfo, RelocationMap, move_code};
pub use service_request::{RetranslateRequest, ServiceRequest, ServiceRequests};
