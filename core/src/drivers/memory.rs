//! In-memory variable store.
//!
//! Holds variables in a map keyed by (name, namespace). Counts mutations and
//! can be told to fail writes to chosen variables, which is how the commit
//! rollback paths get exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use super::uefi_vars::{EfiGuid, VarAttributes, VarRef, VariableStore};
use crate::util::StoreError;

#[derive(Debug, Clone)]
struct StoredVariable {
    attributes: VarAttributes,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    vars: BTreeMap<(String, EfiGuid), StoredVariable>,
    failing_writes: BTreeSet<(String, EfiGuid)>,
    writes: usize,
    deletes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a variable without counting it as a write.
    pub fn insert(&mut self, var: &VarRef, data: impl Into<Vec<u8>>) {
        self.vars.insert(
            key(var),
            StoredVariable {
                attributes: VarAttributes::NV_BS_RT,
                data: data.into(),
            },
        );
    }

    /// Make every later write to `var` fail with an I/O error.
    pub fn fail_writes_to(&mut self, var: &VarRef) {
        self.failing_writes.insert(key(var));
    }

    pub fn get(&self, var: &VarRef) -> Option<&[u8]> {
        self.vars.get(&key(var)).map(|v| v.data.as_slice())
    }

    pub fn attributes(&self, var: &VarRef) -> Option<VarAttributes> {
        self.vars.get(&key(var)).map(|v| v.attributes)
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Number of deletes that removed something.
    pub fn delete_count(&self) -> usize {
        self.deletes
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn key(var: &VarRef) -> (String, EfiGuid) {
    (var.name.to_string(), var.guid)
}

impl VariableStore for MemoryStore {
    fn exists(&self, var: &VarRef) -> bool {
        self.vars.contains_key(&key(var))
    }

    fn read(&self, var: &VarRef) -> Result<Vec<u8>, StoreError> {
        self.vars
            .get(&key(var))
            .map(|v| v.data.clone())
            .ok_or(StoreError::NotFound)
    }

    fn write(&mut self, var: &VarRef, data: &[u8], attrs: VarAttributes) -> Result<(), StoreError> {
        let k = key(var);
        if self.failing_writes.contains(&k) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.vars.insert(
            k,
            StoredVariable {
                attributes: attrs,
                data: data.to_vec(),
            },
        );
        self.writes += 1;
        Ok(())
    }

    fn delete(&mut self, var: &VarRef) -> Result<(), StoreError> {
        if self.vars.remove(&key(var)).is_some() {
            self.deletes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::uefi_vars::vars;

    #[test]
    fn delete_of_missing_variable_is_ok() {
        let mut store = MemoryStore::new();
        assert!(store.delete(&vars::MOK_NEW).is_ok());
        assert_eq!(store.delete_count(), 0);
    }

    #[test]
    fn namespaces_are_distinct() {
        let mut store = MemoryStore::new();
        store.insert(&vars::DB, vec![1, 2, 3]);
        let shadow = VarRef::shim("db");
        assert!(store.exists(&vars::DB));
        assert!(!store.exists(&shadow));
        assert!(store.read(&shadow).unwrap_err().is_not_found());
    }

    #[test]
    fn injected_failure_leaves_store_untouched() {
        let mut store = MemoryStore::new();
        store.fail_writes_to(&vars::MOK_AUTH);
        assert!(store
            .write(&vars::MOK_AUTH, &[0; 32], VarAttributes::NV_BS_RT)
            .is_err());
        assert!(!store.exists(&vars::MOK_AUTH));
        assert_eq!(store.write_count(), 0);
    }
}
