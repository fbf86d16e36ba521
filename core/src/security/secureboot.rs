//! Secure Boot trust databases
//!
//! Membership queries against PK, KEK, db and the MOK lists, plus the
//! SecureBoot state variable.

use std::fmt;

use tracing::debug;

use super::siglist::SignatureList;
use crate::drivers::uefi_vars::{vars, VarRef, VariableStore};
use crate::util::{MokError, MokResult, StoreOp};

/// Secure Boot mode as reported by the global `SecureBoot` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBootMode {
    Enabled,
    Disabled,
    /// Any value other than 0 or 1, or an empty variable.
    Unknown,
}

impl fmt::Display for SecureBootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecureBootMode::Enabled => "SecureBoot enabled",
            SecureBootMode::Disabled => "SecureBoot disabled",
            SecureBootMode::Unknown => "SecureBoot unknown",
        })
    }
}

pub fn secure_boot_mode<S: VariableStore + ?Sized>(store: &S) -> MokResult<SecureBootMode> {
    let data = store
        .read(&vars::SECURE_BOOT)
        .map_err(|e| MokError::store(StoreOp::Read, vars::SECURE_BOOT, e))?;
    Ok(match data.first() {
        Some(1) => SecureBootMode::Enabled,
        Some(0) => SecureBootMode::Disabled,
        _ => SecureBootMode::Unknown,
    })
}

/// Duplicate detection over trust databases.
///
/// A database that cannot be read has no members.
pub struct TrustStoreQuery<'s, S: ?Sized> {
    store: &'s S,
}

impl<'s, S: VariableStore + ?Sized> TrustStoreQuery<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// True if `payload` is byte-for-byte equal to an entry of `db`.
    pub fn is_duplicate(&self, payload: &[u8], db: &VarRef) -> bool {
        if payload.is_empty() {
            return false;
        }

        let data = match self.store.read(db) {
            Ok(data) => data,
            Err(e) => {
                debug!("secureboot: {} unreadable ({}), treating as empty", db, e);
                return false;
            }
        };

        SignatureList::parse(&data).contains_payload(payload)
    }

    /// First database of `dbs` holding `payload`.
    pub fn find_in(&self, payload: &[u8], dbs: &[VarRef]) -> Option<VarRef> {
        dbs.iter().copied().find(|db| self.is_duplicate(payload, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryStore;
    use crate::security::siglist::build;

    #[test]
    fn missing_database_has_no_duplicates() {
        let store = MemoryStore::new();
        let query = TrustStoreQuery::new(&store);
        assert!(!query.is_duplicate(b"cert", &vars::PK));
    }

    #[test]
    fn match_requires_exact_bytes() {
        let mut store = MemoryStore::new();
        store.insert(&vars::DB, build(&[b"cert-a".as_slice(), b"cert-b".as_slice()]).unwrap());
        let query = TrustStoreQuery::new(&store);

        assert!(query.is_duplicate(b"cert-b", &vars::DB));
        assert!(!query.is_duplicate(b"cert-", &vars::DB));
        assert!(!query.is_duplicate(b"cert-bb", &vars::DB));
        assert!(!query.is_duplicate(b"", &vars::DB));
    }

    #[test]
    fn namespace_is_part_of_the_lookup() {
        let mut store = MemoryStore::new();
        store.insert(&vars::DB, build(&[b"cert".as_slice()]).unwrap());
        let query = TrustStoreQuery::new(&store);
        let global_db = VarRef::new("db", crate::drivers::guids::EFI_GLOBAL_VARIABLE);

        assert!(!query.is_duplicate(b"cert", &global_db));
        assert_eq!(query.find_in(b"cert", &[vars::PK, global_db, vars::DB]), Some(vars::DB));
    }

    #[test]
    fn secure_boot_state_values() {
        let mut store = MemoryStore::new();
        assert!(secure_boot_mode(&store).is_err());

        store.insert(&vars::SECURE_BOOT, vec![1]);
        assert_eq!(secure_boot_mode(&store).unwrap(), SecureBootMode::Enabled);
        store.insert(&vars::SECURE_BOOT, vec![0]);
        assert_eq!(secure_boot_mode(&store).unwrap(), SecureBootMode::Disabled);
        store.insert(&vars::SECURE_BOOT, vec![2]);
        assert_eq!(secure_boot_mode(&store).unwrap(), SecureBootMode::Unknown);
    }
}
