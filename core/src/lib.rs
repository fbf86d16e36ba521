//! Pending Machine Owner Key requests for shim.
//!
//! Requests are staged in firmware variables and acted on by MokManager at
//! the next boot. See [`security::mok::MokManager`] for the operations.

pub mod config;
pub mod crypto;
pub mod drivers;
pub mod security;
pub mod util;

pub use config::MokConfig;
pub use drivers::{EfivarfsStore, MemoryStore, VariableStore};
pub use security::{Completion, MokManager, MokOperation, RequestKind, RequestStatus};
pub use util::{AuthError, MokError, MokResult, StoreError};
