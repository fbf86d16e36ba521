//! Firmware variable access.

pub mod efivarfs;
pub mod memory;
pub mod uefi_vars;

pub use efivarfs::EfivarfsStore;
pub use memory::MemoryStore;
pub use uefi_vars::{guids, vars, EfiGuid, VarAttributes, VarRef, VariableStore};
