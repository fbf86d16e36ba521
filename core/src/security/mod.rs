//! Secure Boot key management.

pub mod cert;
pub mod mok;
pub mod password;
pub mod secureboot;
pub mod siglist;

pub use mok::{
    Completion, MokManager, MokOperation, PendingRequestStore, RequestBuilder, RequestKind,
    RequestReport, RequestStatus,
};
pub use password::{Console, Credential, PasswordPolicy, ScriptedConsole, TtyConsole};
pub use secureboot::{SecureBootMode, TrustStoreQuery};
pub use siglist::{SignatureEntry, SignatureKind, SignatureList, SignatureListBuilder};
