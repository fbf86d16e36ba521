//! Machine Owner Key (MOK) Manager
//!
//! Builds the requests shim acts on at the next boot:
//! - Key enrollment (`MokNew` + `MokAuth`)
//! - Key deletion (`MokDel` + `MokDelAuth`)
//! - Reset of the enrolled list (`MokAuth` alone)
//! - MOK password (`MokPW`) and validation state (`MokSB`)
//!
//! Enrollment and deletion requests are password protected. Appending to a
//! request that is already pending requires that request's password.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::cert::{describe_entry, is_valid_der_certificate};
use super::password::{
    acquire_new_password, derive_witness, verify_existing_password, Console, Credential,
    PasswordPolicy, PASSWORD_MAX,
};
use super::secureboot::{secure_boot_mode, SecureBootMode, TrustStoreQuery};
use super::siglist::{SignatureList, SignatureListBuilder};
use crate::config::MokConfig;
use crate::drivers::uefi_vars::{guids, vars, VarAttributes, VarRef, VariableStore};
use crate::util::{AuthError, MokError, MokResult, StoreOp};

/// Databases an imported key must not already be in.
pub const IMPORT_FORBIDDEN: [VarRef; 5] = [
    vars::PK,
    vars::KEK,
    vars::DB,
    vars::MOK_LIST_RT,
    vars::MOK_NEW,
];

/// Databases `test_key` consults. `db` is looked up in the global
/// namespace here, unlike the import admission check.
pub const TEST_KEY_DATABASES: [VarRef; 5] = [
    vars::PK,
    vars::KEK,
    VarRef::new("db", guids::EFI_GLOBAL_VARIABLE),
    vars::MOK_LIST_RT,
    vars::MOK_NEW,
];

/// Size of the `MokSB` record: state, length, fixed password field.
pub const MOK_SB_SIZE: usize = 4 + 4 + PASSWORD_MAX * 2;

/// Kind of pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Import,
    Delete,
}

impl RequestKind {
    pub fn list_var(&self) -> VarRef {
        match self {
            Self::Import => vars::MOK_NEW,
            Self::Delete => vars::MOK_DEL,
        }
    }

    pub fn auth_var(&self) -> VarRef {
        match self {
            Self::Import => vars::MOK_AUTH,
            Self::Delete => vars::MOK_DEL_AUTH,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Delete => "delete",
        }
    }
}

/// MOK operation type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MokOperation {
    ListEnrolled,
    ListNew,
    Import(Vec<PathBuf>),
    Delete(Vec<PathBuf>),
    Revoke,
    Export,
    SetPassword,
    /// `true` enables signature validation, `false` disables it.
    SetValidation(bool),
    ShowState,
    TestKey(PathBuf),
    Reset,
}

/// Why a candidate key was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Already present in the named database.
    Duplicate(VarRef),
    /// Deletion of a key that is not enrolled.
    NotEnrolled,
}

/// A key file read from disk.
#[derive(Debug, Clone)]
pub struct CandidateKey {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Read every file up front; one unreadable file fails the batch.
pub fn read_candidates(paths: &[PathBuf]) -> MokResult<Vec<CandidateKey>> {
    paths
        .iter()
        .map(|path| {
            let data = fs::read(path).map_err(|source| MokError::Input {
                path: path.clone(),
                source,
            })?;
            Ok(CandidateKey {
                path: path.clone(),
                data,
            })
        })
        .collect()
}

/// Newly admitted entries, before merging with a pending request.
#[derive(Debug, Clone, Default)]
pub struct PreparedRequest {
    pub bytes: Vec<u8>,
    pub accepted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

impl PreparedRequest {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Applies the per-kind admission policy and serializes admitted keys.
pub struct RequestBuilder<'s, S: ?Sized> {
    query: TrustStoreQuery<'s, S>,
    kind: RequestKind,
}

impl<'s, S: VariableStore + ?Sized> RequestBuilder<'s, S> {
    pub fn new(store: &'s S, kind: RequestKind) -> Self {
        Self {
            query: TrustStoreQuery::new(store),
            kind,
        }
    }

    pub fn admit(&self, payload: &[u8]) -> Admission {
        match self.kind {
            RequestKind::Import => match self.query.find_in(payload, &IMPORT_FORBIDDEN) {
                Some(db) => Admission::Duplicate(db),
                None => Admission::Accept,
            },
            RequestKind::Delete => {
                if !self.query.is_duplicate(payload, &vars::MOK_LIST_RT) {
                    Admission::NotEnrolled
                } else if self.query.is_duplicate(payload, &vars::MOK_DEL) {
                    Admission::Duplicate(vars::MOK_DEL)
                } else {
                    Admission::Accept
                }
            }
        }
    }

    /// One certificate entry per admitted candidate, in input order.
    pub fn prepare<C: Console + ?Sized>(
        &self,
        candidates: &[CandidateKey],
        console: &mut C,
    ) -> MokResult<PreparedRequest> {
        let mut builder = SignatureListBuilder::new();
        let mut prepared = PreparedRequest::default();

        for candidate in candidates {
            let shown = candidate.path.display();
            if !is_valid_der_certificate(&candidate.data) {
                console.error(&format!(
                    "Warning!!! {} is not a valid x509 certificate in DER format",
                    shown
                ));
            }

            match self.admit(&candidate.data) {
                Admission::Accept => {
                    builder
                        .push_certificate(&candidate.data)
                        .map_err(|_| MokError::TooLarge {
                            path: candidate.path.clone(),
                        })?;
                    prepared.accepted.push(candidate.path.clone());
                }
                reason => {
                    debug!("mok: {} rejected for {}: {:?}", shown, self.kind.as_str(), reason);
                    console.info(&format!("Skip {}", shown));
                    prepared.skipped.push(candidate.path.clone());
                }
            }
        }

        prepared.bytes = builder.into_bytes();
        Ok(prepared)
    }
}

/// Writes and removes the (list, auth) variable pairs.
pub struct PendingRequestStore<'s, S: ?Sized> {
    store: &'s mut S,
}

impl<'s, S: VariableStore + ?Sized> PendingRequestStore<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    /// Write `request` (or clear the list when `None`), then its auth digest.
    ///
    /// The list is written first; if the auth write fails afterwards the list
    /// is deleted again so no unauthenticated request is left behind.
    pub fn commit(
        &mut self,
        request: Option<&[u8]>,
        password: &Credential,
        kind: RequestKind,
    ) -> MokResult<()> {
        let list_var = kind.list_var();
        let auth_var = kind.auth_var();

        match request {
            Some(bytes) => self
                .store
                .write(&list_var, bytes, VarAttributes::NV_BS_RT)
                .map_err(|e| MokError::store(StoreOp::Write, list_var, e))?,
            None => self
                .store
                .delete(&list_var)
                .map_err(|e| MokError::store(StoreOp::Delete, list_var, e))?,
        }

        let witness = derive_witness(request, password);
        if let Err(e) = self.store.write(&auth_var, &witness, VarAttributes::NV_BS_RT) {
            if request.is_some() {
                if let Err(rollback) = self.store.delete(&list_var) {
                    warn!("mok: failed to roll back {}: {}", list_var, rollback);
                }
            }
            return Err(MokError::store(StoreOp::Write, auth_var, e));
        }

        info!(
            "mok: {} request committed ({} bytes)",
            kind.as_str(),
            request.map_or(0, <[u8]>::len)
        );
        Ok(())
    }

    /// Remove both variables of `kind`. Missing variables are fine.
    pub fn revoke(&mut self, kind: RequestKind) -> MokResult<()> {
        for var in [kind.list_var(), kind.auth_var()] {
            self.store
                .delete(&var)
                .map_err(|e| MokError::store(StoreOp::Delete, var, e))?;
        }
        info!("mok: {} request revoked", kind.as_str());
        Ok(())
    }
}

/// MOK operation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Nothing left to request; no password asked, nothing written.
    NoOp,
    Committed { merged: bool, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReport {
    pub kind: RequestKind,
    pub accepted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub status: RequestStatus,
}

/// What a completed operation has to tell the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done,
    Request(RequestReport),
    Exported(Vec<PathBuf>),
    State(SecureBootMode),
    KeyStatus { enrolled: bool },
}

/// MOK Manager
pub struct MokManager<S, C> {
    store: S,
    console: C,
    config: MokConfig,
    policy: PasswordPolicy,
}

impl<S: VariableStore, C: Console> MokManager<S, C> {
    pub fn new(store: S, console: C, config: MokConfig) -> MokResult<Self> {
        config.validate()?;
        let policy = PasswordPolicy::from(&config);
        Ok(Self {
            store,
            console,
            config,
            policy,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn config(&self) -> &MokConfig {
        &self.config
    }

    pub fn into_parts(self) -> (S, C) {
        (self.store, self.console)
    }

    /// Run one operation.
    pub fn run(&mut self, op: MokOperation) -> MokResult<Completion> {
        debug!("mok: running {:?}", op);
        match op {
            MokOperation::ListEnrolled => self.list_enrolled().map(|_| Completion::Done),
            MokOperation::ListNew => self.list_new().map(|_| Completion::Done),
            MokOperation::Import(files) => self.import(&files).map(Completion::Request),
            MokOperation::Delete(files) => self.delete(&files).map(Completion::Request),
            MokOperation::Revoke => self.revoke().map(|_| Completion::Done),
            MokOperation::Export => self.export().map(Completion::Exported),
            MokOperation::SetPassword => self.set_password().map(|_| Completion::Done),
            MokOperation::SetValidation(enable) => {
                self.set_validation(enable).map(|_| Completion::Done)
            }
            MokOperation::ShowState => self.show_state().map(Completion::State),
            MokOperation::TestKey(file) => self
                .test_key(&file)
                .map(|enrolled| Completion::KeyStatus { enrolled }),
            MokOperation::Reset => self.reset().map(|_| Completion::Done),
        }
    }

    pub fn list_enrolled(&mut self) -> MokResult<usize> {
        self.list_keys(&vars::MOK_LIST_RT)
    }

    pub fn list_new(&mut self) -> MokResult<usize> {
        self.list_keys(&vars::MOK_NEW)
    }

    fn list_keys(&mut self, var: &VarRef) -> MokResult<usize> {
        let data = self
            .store
            .read(var)
            .map_err(|e| MokError::store(StoreOp::Read, var, e))?;
        let list = SignatureList::parse(&data);

        for (i, entry) in list.iter().enumerate() {
            if i > 0 {
                self.console.info("");
            }
            self.console.info(&format!("[key {}]", i + 1));
            self.console.info(describe_entry(entry).trim_end());
        }
        Ok(list.len())
    }

    pub fn import(&mut self, files: &[PathBuf]) -> MokResult<RequestReport> {
        self.issue_request(files, RequestKind::Import)
    }

    pub fn delete(&mut self, files: &[PathBuf]) -> MokResult<RequestReport> {
        self.issue_request(files, RequestKind::Delete)
    }

    fn issue_request(&mut self, files: &[PathBuf], kind: RequestKind) -> MokResult<RequestReport> {
        let candidates = read_candidates(files)?;
        let prepared = RequestBuilder::new(&self.store, kind).prepare(&candidates, &mut self.console)?;

        let PreparedRequest {
            bytes: mut request,
            accepted,
            skipped,
        } = prepared;

        if request.is_empty() {
            info!("mok: nothing to {}, all keys skipped", kind.as_str());
            return Ok(RequestReport {
                kind,
                accepted,
                skipped,
                status: RequestStatus::NoOp,
            });
        }

        let list_var = kind.list_var();
        let pending = match self.store.read(&list_var) {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(MokError::store(StoreOp::Read, list_var, e)),
        };

        let merged = match pending {
            Some(old) => {
                let verified = verify_existing_password(
                    &self.store,
                    &mut self.console,
                    &self.policy,
                    &old,
                    &kind.auth_var(),
                )?;
                if !verified {
                    return Err(AuthError::VerificationFailed.into());
                }
                request.extend_from_slice(&old);
                true
            }
            None => false,
        };

        let password = acquire_new_password(&mut self.console, &self.policy)?;
        PendingRequestStore::new(&mut self.store).commit(Some(&request), &password, kind)?;

        Ok(RequestReport {
            kind,
            accepted,
            skipped,
            status: RequestStatus::Committed {
                merged,
                size: request.len(),
            },
        })
    }

    pub fn revoke(&mut self) -> MokResult<()> {
        self.revoke_kind(RequestKind::Import)
    }

    pub fn revoke_kind(&mut self, kind: RequestKind) -> MokResult<()> {
        PendingRequestStore::new(&mut self.store).revoke(kind)
    }

    /// Write each enrolled key to `MOK-NNNN.der` in the export directory.
    pub fn export(&mut self) -> MokResult<Vec<PathBuf>> {
        let data = self
            .store
            .read(&vars::MOK_LIST_RT)
            .map_err(|e| MokError::store(StoreOp::Read, vars::MOK_LIST_RT, e))?;
        let list = SignatureList::parse(&data);

        let mut written = Vec::with_capacity(list.len());
        for (i, entry) in list.iter().enumerate() {
            let path = self.config.export_dir.join(format!("MOK-{:04}.der", i + 1));
            write_export(&path, entry.payload)?;
            written.push(path);
        }
        info!("mok: exported {} keys", written.len());
        Ok(written)
    }

    pub fn set_password(&mut self) -> MokResult<()> {
        let password = acquire_new_password(&mut self.console, &self.policy)?;
        let witness = derive_witness(None, &password);
        self.store
            .write(&vars::MOK_PW, &witness, VarAttributes::NV_BS_RT)
            .map_err(|e| MokError::store(StoreOp::Write, vars::MOK_PW, e))
    }

    pub fn set_validation(&mut self, enable: bool) -> MokResult<()> {
        let password = acquire_new_password(&mut self.console, &self.policy)?;
        let record = validation_request(enable, &password);
        self.store
            .write(&vars::MOK_SB, &record, VarAttributes::NV_BS_RT)
            .map_err(|e| MokError::store(StoreOp::Write, vars::MOK_SB, e))?;
        info!("mok: validation state change requested (enable={})", enable);
        Ok(())
    }

    pub fn show_state(&mut self) -> MokResult<SecureBootMode> {
        let mode = secure_boot_mode(&self.store)?;
        self.console.info(&mode.to_string());
        Ok(mode)
    }

    /// Report whether the key in `file` is already enrolled or pending.
    pub fn test_key(&mut self, file: &Path) -> MokResult<bool> {
        let data = fs::read(file).map_err(|source| MokError::Input {
            path: file.to_path_buf(),
            source,
        })?;

        let query = TrustStoreQuery::new(&self.store);
        let enrolled = query.find_in(&data, &TEST_KEY_DATABASES).is_some();
        if enrolled {
            self.console.info(&format!("{} is already enrolled", file.display()));
        } else {
            self.console.info(&format!("{} is not enrolled", file.display()));
        }
        Ok(enrolled)
    }

    /// Ask shim to clear the enrolled list at next boot.
    pub fn reset(&mut self) -> MokResult<()> {
        let password = acquire_new_password(&mut self.console, &self.policy)?;
        PendingRequestStore::new(&mut self.store).commit(None, &password, RequestKind::Import)
    }
}

/// `MokSB` record: state, password length, password padded to the field.
pub fn validation_request(enable: bool, password: &Credential) -> Zeroizing<Vec<u8>> {
    let units = password.code_units();
    let mut record = Zeroizing::new(Vec::with_capacity(MOK_SB_SIZE));
    record.extend_from_slice(&u32::from(enable).to_le_bytes());
    record.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for i in 0..PASSWORD_MAX {
        let unit = units.get(i).copied().unwrap_or(0);
        record.extend_from_slice(&unit.to_le_bytes());
    }
    record
}

fn write_export(path: &Path, payload: &[u8]) -> MokResult<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    options
        .open(path)
        .and_then(|mut f| f.write_all(payload))
        .map_err(|source| MokError::Output {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryStore;
    use crate::security::password::ScriptedConsole;
    use crate::security::siglist::build;

    fn candidate(name: &str, data: &[u8]) -> CandidateKey {
        CandidateKey {
            path: PathBuf::from(name),
            data: data.to_vec(),
        }
    }

    #[test]
    fn import_rejects_keys_in_any_forbidden_database() {
        for db in IMPORT_FORBIDDEN {
            let mut store = MemoryStore::new();
            store.insert(&db, build(&[b"known".as_slice()]).unwrap());
            let builder = RequestBuilder::new(&store, RequestKind::Import);

            assert_eq!(builder.admit(b"known"), Admission::Duplicate(db));
            assert_eq!(builder.admit(b"fresh"), Admission::Accept);
        }
    }

    #[test]
    fn delete_requires_enrollment_and_no_pending_delete() {
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_LIST_RT, build(&[b"a".as_slice(), b"b".as_slice()]).unwrap());
        store.insert(&vars::MOK_DEL, build(&[b"b".as_slice()]).unwrap());
        let builder = RequestBuilder::new(&store, RequestKind::Delete);

        assert_eq!(builder.admit(b"a"), Admission::Accept);
        assert_eq!(builder.admit(b"b"), Admission::Duplicate(vars::MOK_DEL));
        assert_eq!(builder.admit(b"c"), Admission::NotEnrolled);
    }

    #[test]
    fn prepare_skips_and_warns_but_continues() {
        let mut store = MemoryStore::new();
        store.insert(&vars::DB, build(&[b"in-db".as_slice()]).unwrap());
        let builder = RequestBuilder::new(&store, RequestKind::Import);
        let mut console = ScriptedConsole::default();

        let prepared = builder
            .prepare(
                &[candidate("a.der", b"new-a"), candidate("b.der", b"in-db"), candidate("c.der", b"new-c")],
                &mut console,
            )
            .unwrap();

        assert_eq!(prepared.accepted, vec![PathBuf::from("a.der"), PathBuf::from("c.der")]);
        assert_eq!(prepared.skipped, vec![PathBuf::from("b.der")]);
        assert_eq!(prepared.bytes, build(&[b"new-a".as_slice(), b"new-c".as_slice()]).unwrap());
        assert_eq!(console.infos(), &["Skip b.der".to_string()]);
        assert_eq!(console.errors().len(), 3);
    }

    #[test]
    fn commit_without_request_clears_list_and_writes_auth() {
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_NEW, build(&[b"stale".as_slice()]).unwrap());
        let pw = Credential::new("pass1234");

        PendingRequestStore::new(&mut store)
            .commit(None, &pw, RequestKind::Import)
            .unwrap();

        assert!(!store.exists(&vars::MOK_NEW));
        assert_eq!(store.get(&vars::MOK_AUTH), Some(derive_witness(None, &pw).as_slice()));
        assert_eq!(store.attributes(&vars::MOK_AUTH), Some(VarAttributes::NV_BS_RT));
    }

    #[test]
    fn failed_list_write_never_writes_auth() {
        let mut store = MemoryStore::new();
        store.fail_writes_to(&vars::MOK_DEL);
        let pw = Credential::new("pass1234");

        let err = PendingRequestStore::new(&mut store)
            .commit(Some(b"entries"), &pw, RequestKind::Delete)
            .unwrap_err();

        assert!(matches!(err, MokError::Store { op: StoreOp::Write, .. }));
        assert!(!store.exists(&vars::MOK_DEL_AUTH));
    }

    #[test]
    fn failed_auth_write_rolls_back_list() {
        let mut store = MemoryStore::new();
        store.fail_writes_to(&vars::MOK_AUTH);
        let pw = Credential::new("pass1234");

        let err = PendingRequestStore::new(&mut store)
            .commit(Some(b"entries"), &pw, RequestKind::Import)
            .unwrap_err();

        assert!(matches!(err, MokError::Store { ref var, .. } if var == "MokAuth"));
        assert!(store.read(&vars::MOK_NEW).unwrap_err().is_not_found());
    }

    #[test]
    fn revoke_is_idempotent() {
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_NEW, vec![1]);
        store.insert(&vars::MOK_AUTH, vec![2; 32]);
        store.insert(&vars::MOK_DEL, vec![3]);

        let mut pending = PendingRequestStore::new(&mut store);
        pending.revoke(RequestKind::Import).unwrap();
        pending.revoke(RequestKind::Import).unwrap();

        assert!(!store.exists(&vars::MOK_NEW));
        assert!(!store.exists(&vars::MOK_AUTH));
        assert!(store.exists(&vars::MOK_DEL));
    }

    #[test]
    fn validation_record_layout() {
        let record = validation_request(false, &Credential::new("pass1234"));
        assert_eq!(record.len(), MOK_SB_SIZE);
        assert_eq!(&record[0..4], &[0, 0, 0, 0]);
        assert_eq!(&record[4..8], &[8, 0, 0, 0]);
        assert_eq!(&record[8..10], &[b'p', 0]);
        assert_eq!(&record[22..24], &[b'4', 0]);
        assert!(record[24..].iter().all(|&b| b == 0));

        let record = validation_request(true, &Credential::new("pass1234"));
        assert_eq!(&record[0..4], &[1, 0, 0, 0]);
    }
}
