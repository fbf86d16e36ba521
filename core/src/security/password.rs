//! MOK password protocol
//!
//! Shim authorizes a pending request by recomputing
//! `SHA-256(request bytes || UTF-16LE(password))` and comparing it with the
//! stored auth variable. This module computes that witness and runs the
//! prompts that collect passwords: a new password (entered twice) or the
//! password of an existing request.
//!
//! Passwords live in zeroizing buffers and are never written anywhere; only
//! the witness is persisted.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::MokConfig;
use crate::crypto::{Sha256Digest, SHA256_DIGEST_SIZE};
use crate::drivers::uefi_vars::{VarRef, VariableStore};
use crate::util::{AuthError, MokError, MokResult, StoreOp};

pub const PASSWORD_MIN: usize = 8;
/// Width of the firmware's password field, in UTF-16 code units.
pub const PASSWORD_MAX: usize = 16;

/// Line-oriented user interaction.
pub trait Console {
    /// Show `prompt` and read one line without echo. `Ok(None)` at end of input.
    fn read_hidden(&mut self, prompt: &str) -> io::Result<Option<Zeroizing<String>>>;

    /// Informational message (stdout).
    fn info(&mut self, msg: &str);

    /// Problem report (stderr).
    fn error(&mut self, msg: &str);
}

impl<C: Console + ?Sized> Console for &mut C {
    fn read_hidden(&mut self, prompt: &str) -> io::Result<Option<Zeroizing<String>>> {
        (**self).read_hidden(prompt)
    }

    fn info(&mut self, msg: &str) {
        (**self).info(msg)
    }

    fn error(&mut self, msg: &str) {
        (**self).error(msg)
    }
}

/// A password held only for the duration of one operation.
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in UTF-16 code units.
    pub fn units(&self) -> usize {
        self.0.encode_utf16().count()
    }

    /// UTF-16 code units as the firmware stores them, at most `PASSWORD_MAX`.
    pub fn code_units(&self) -> Zeroizing<Vec<u16>> {
        Zeroizing::new(self.0.encode_utf16().take(PASSWORD_MAX).collect())
    }

    /// Little-endian bytes of `code_units`, no terminator.
    pub fn encode_utf16le(&self) -> Zeroizing<Vec<u8>> {
        let units = self.code_units();
        let mut out = Zeroizing::new(Vec::with_capacity(units.len() * 2));
        for unit in units.iter() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Witness binding `request` (if any) to `password`.
pub fn derive_witness(request: Option<&[u8]>, password: &Credential) -> Sha256Digest {
    let mut hasher = Sha256::new();
    if let Some(request) = request {
        hasher.update(request);
    }
    hasher.update(password.encode_utf16le().as_slice());
    hasher.finalize().into()
}

/// Length bounds and retry budget for password prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min: usize,
    pub max: usize,
    pub attempts: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min: PASSWORD_MIN,
            max: PASSWORD_MAX,
            attempts: 3,
        }
    }
}

impl From<&MokConfig> for PasswordPolicy {
    fn from(config: &MokConfig) -> Self {
        Self {
            min: config.min_password_length,
            max: config.max_password_length,
            attempts: config.password_attempts,
        }
    }
}

impl PasswordPolicy {
    pub fn admits(&self, password: &Credential) -> bool {
        (self.min..=self.max).contains(&password.units())
    }
}

fn prompt<C: Console + ?Sized>(console: &mut C, text: &str) -> MokResult<Credential> {
    match console.read_hidden(text) {
        Ok(Some(line)) => Ok(Credential(line)),
        Ok(None) => Err(AuthError::InputClosed.into()),
        // Undecodable input is an empty entry, which no policy admits.
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            debug!("password: discarding undecodable input");
            Ok(Credential::new(String::new()))
        }
        Err(e) => Err(MokError::Terminal(e)),
    }
}

/// Ask for a new password and its confirmation.
///
/// Each phase has its own attempt budget; running out of either aborts.
pub fn acquire_new_password<C: Console + ?Sized>(
    console: &mut C,
    policy: &PasswordPolicy,
) -> MokResult<Credential> {
    let entry_prompt = format!("input password ({}~{} characters): ", policy.min, policy.max);

    let mut first = None;
    for _ in 0..policy.attempts {
        let candidate = prompt(console, &entry_prompt)?;
        if policy.admits(&candidate) {
            first = Some(candidate);
            break;
        }
        console.error(&format!(
            "password should be {}~{} characters",
            policy.min, policy.max
        ));
    }
    let first = first.ok_or(AuthError::LengthPolicyExhausted)?;

    for _ in 0..policy.attempts {
        let again = prompt(console, "input password again: ")?;
        if again.as_str() == first.as_str() {
            debug!("password: new password confirmed");
            return Ok(first);
        }
        console.error("password doesn't match");
    }

    Err(AuthError::ConfirmationExhausted.into())
}

/// Check a typed password against the witness stored in `auth_var`,
/// computed over `reference`.
///
/// Returns `Ok(false)` once the attempt budget is spent.
pub fn verify_existing_password<S, C>(
    store: &S,
    console: &mut C,
    policy: &PasswordPolicy,
    reference: &[u8],
    auth_var: &VarRef,
) -> MokResult<bool>
where
    S: VariableStore + ?Sized,
    C: Console + ?Sized,
{
    let stored = store
        .read(auth_var)
        .map_err(|e| MokError::store(StoreOp::Read, auth_var, e))?;
    if stored.len() != SHA256_DIGEST_SIZE {
        return Err(MokError::Malformed {
            var: auth_var.to_string(),
            reason: "auth digest is not 32 bytes",
        });
    }

    for attempt in 1..=policy.attempts {
        let candidate = prompt(console, "input old password: ")?;
        if !policy.admits(&candidate) {
            console.error("invalid password");
            continue;
        }

        let witness = derive_witness(Some(reference), &candidate);
        if bool::from(stored.as_slice().ct_eq(&witness)) {
            info!("password: {} verified on attempt {}", auth_var, attempt);
            return Ok(true);
        }
        console.error("password doesn't match the pending request");
    }

    Ok(false)
}

/// Echo suppression on standard input, restored on drop.
///
/// Inert when standard input is not a terminal.
pub struct EchoGuard {
    #[cfg(target_os = "linux")]
    saved: Option<libc::termios>,
}

impl EchoGuard {
    #[cfg(target_os = "linux")]
    pub fn suppress() -> io::Result<Self> {
        let fd = libc::STDIN_FILENO;

        // SAFETY: isatty only inspects the descriptor.
        if unsafe { libc::isatty(fd) } != 1 {
            return Ok(Self { saved: None });
        }

        // SAFETY: termios is plain data; tcgetattr fills it in.
        let mut old: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut old) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut quiet = old;
        quiet.c_lflag &= !libc::ECHO;
        // SAFETY: quiet is a valid termios derived from the current one.
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &quiet) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { saved: Some(old) })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn suppress() -> io::Result<Self> {
        Ok(Self {})
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Some(old) = self.saved.take() {
            // SAFETY: restores the settings captured in `suppress`.
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &old);
            }
        }
    }
}

/// Console on the process's standard streams.
#[derive(Debug, Default)]
pub struct TtyConsole;

impl TtyConsole {
    pub fn new() -> Self {
        Self
    }
}

impl Console for TtyConsole {
    fn read_hidden(&mut self, prompt: &str) -> io::Result<Option<Zeroizing<String>>> {
        let mut stdout = io::stdout();
        stdout.write_all(prompt.as_bytes())?;
        stdout.flush()?;

        let mut raw = Zeroizing::new(Vec::new());
        let read = {
            let _guard = EchoGuard::suppress()?;
            io::stdin().lock().read_until(b'\n', &mut raw)
        };
        // The newline typed by the user was not echoed.
        writeln!(stdout)?;

        if read? == 0 {
            return Ok(None);
        }
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        match std::str::from_utf8(&raw) {
            Ok(line) => Ok(Some(Zeroizing::new(line.to_owned()))),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "password is not valid UTF-8",
            )),
        }
    }

    fn info(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn error(&mut self, msg: &str) {
        eprintln!("{}", msg);
    }
}

/// Console fed from a fixed list of lines, recording everything shown.
///
/// A `None` line reads back as undecodable input.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    inputs: VecDeque<Option<String>>,
    prompts: Vec<String>,
    infos: Vec<String>,
    errors: Vec<String>,
}

impl ScriptedConsole {
    pub fn new<I, T>(inputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(|line| Some(line.into())).collect(),
            ..Self::default()
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.inputs.push_back(Some(line.into()));
    }

    /// Queue a line that is not valid UTF-8.
    pub fn push_undecodable(&mut self) {
        self.inputs.push_back(None);
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn infos(&self) -> &[String] {
        &self.infos
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Lines not yet consumed.
    pub fn remaining(&self) -> usize {
        self.inputs.len()
    }
}

impl Console for ScriptedConsole {
    fn read_hidden(&mut self, prompt: &str) -> io::Result<Option<Zeroizing<String>>> {
        self.prompts.push(prompt.to_string());
        match self.inputs.pop_front() {
            None => Ok(None),
            Some(Some(line)) => Ok(Some(Zeroizing::new(line))),
            Some(None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "scripted undecodable line",
            )),
        }
    }

    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{vars, MemoryStore};

    fn policy() -> PasswordPolicy {
        PasswordPolicy::default()
    }

    #[test]
    fn witness_without_request_hashes_utf16le_password() {
        let pw = Credential::new("pass1234");
        assert_eq!(pw.encode_utf16le().len(), 16);
        assert_eq!(
            hex::encode(derive_witness(None, &pw)),
            "ef655eec407a87214e2912642e9e758d8349718be961f42c6c5278124a7341c9"
        );
    }

    #[test]
    fn witness_covers_request_then_password() {
        let pw = Credential::new("pass1234");
        let mut joined = b"request".to_vec();
        joined.extend_from_slice(&pw.encode_utf16le());
        assert_eq!(derive_witness(Some(b"request".as_slice()), &pw), crate::crypto::sha256(&joined));
        assert_ne!(derive_witness(Some(b"request".as_slice()), &pw), derive_witness(None, &pw));
    }

    #[test]
    fn encoding_is_bounded_to_field_width() {
        let pw = Credential::new("a".repeat(20));
        assert_eq!(pw.code_units().len(), PASSWORD_MAX);
        assert_eq!(pw.encode_utf16le().len(), PASSWORD_MAX * 2);
    }

    #[test]
    fn length_counts_code_units() {
        assert_eq!(Credential::new("pässwörd").units(), 8);
        assert_eq!(Credential::new("\u{1F512}abcdef").units(), 8);
    }

    #[test]
    fn new_password_accepted_on_first_try() {
        let mut console = ScriptedConsole::new(["pass1234", "pass1234"]);
        let pw = acquire_new_password(&mut console, &policy()).unwrap();
        assert_eq!(pw.as_str(), "pass1234");
        assert!(console.errors().is_empty());
        assert_eq!(console.prompts().len(), 2);
    }

    #[test]
    fn out_of_range_lengths_are_rejected_and_counted() {
        let mut console = ScriptedConsole::new(["short12", "a".repeat(17).as_str(), "pass1234", "pass1234"]);
        let pw = acquire_new_password(&mut console, &policy()).unwrap();
        assert_eq!(pw.as_str(), "pass1234");
        assert_eq!(console.errors().len(), 2);
        assert_eq!(console.errors()[0], "password should be 8~16 characters");
    }

    #[test]
    fn three_bad_lengths_abort() {
        let mut console = ScriptedConsole::new(["short", "tiny", "x", "pass1234"]);
        let err = acquire_new_password(&mut console, &policy()).unwrap_err();
        assert!(matches!(err, MokError::Auth(AuthError::LengthPolicyExhausted)));
        assert_eq!(console.remaining(), 1);
    }

    #[test]
    fn mismatch_budget_is_independent() {
        let mut console = ScriptedConsole::new([
            "bad", "bad", "pass1234", "pass4321", "pass1234",
        ]);
        let pw = acquire_new_password(&mut console, &policy()).unwrap();
        assert_eq!(pw.as_str(), "pass1234");
        assert_eq!(console.errors().len(), 3);
    }

    #[test]
    fn three_mismatches_abort() {
        let mut console = ScriptedConsole::new(["pass1234", "pass0000", "pass1111", "pass2222"]);
        let err = acquire_new_password(&mut console, &policy()).unwrap_err();
        assert!(matches!(err, MokError::Auth(AuthError::ConfirmationExhausted)));
        assert_eq!(console.errors().iter().filter(|e| *e == "password doesn't match").count(), 3);
    }

    #[test]
    fn end_of_input_aborts_immediately() {
        let mut console = ScriptedConsole::new(["pass1234"]);
        let err = acquire_new_password(&mut console, &policy()).unwrap_err();
        assert!(matches!(err, MokError::Auth(AuthError::InputClosed)));
    }

    #[test]
    fn verification_succeeds_on_second_attempt() {
        let reference = b"old request".to_vec();
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_AUTH, derive_witness(Some(reference.as_slice()), &Credential::new("oldpass1")).to_vec());

        let mut console = ScriptedConsole::new(["wrongpass", "oldpass1", "unused12"]);
        let ok = verify_existing_password(&store, &mut console, &policy(), &reference, &vars::MOK_AUTH).unwrap();
        assert!(ok);
        assert_eq!(console.remaining(), 1);
    }

    #[test]
    fn verification_exhausts_budget() {
        let reference = b"old request".to_vec();
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_AUTH, derive_witness(Some(reference.as_slice()), &Credential::new("oldpass1")).to_vec());

        let mut console = ScriptedConsole::new(["short", "wrongpass", "oldpass2", "oldpass1"]);
        let ok = verify_existing_password(&store, &mut console, &policy(), &reference, &vars::MOK_AUTH).unwrap();
        assert!(!ok);
        assert_eq!(console.errors()[0], "invalid password");
    }

    #[test]
    fn undecodable_entry_costs_one_attempt() {
        let mut console = ScriptedConsole::default();
        console.push_undecodable();
        console.push_line("pass1234");
        console.push_line("pass1234");

        let pw = acquire_new_password(&mut console, &policy()).unwrap();
        assert_eq!(pw.as_str(), "pass1234");
        assert_eq!(console.errors(), &["password should be 8~16 characters".to_string()]);
    }

    #[test]
    fn undecodable_old_password_is_rejected_not_fatal() {
        let reference = b"old request".to_vec();
        let mut store = MemoryStore::new();
        store.insert(&vars::MOK_AUTH, derive_witness(Some(reference.as_slice()), &Credential::new("oldpass1")).to_vec());

        let mut console = ScriptedConsole::default();
        console.push_undecodable();
        console.push_line("oldpass1");

        let ok = verify_existing_password(&store, &mut console, &policy(), &reference, &vars::MOK_AUTH).unwrap();
        assert!(ok);
        assert_eq!(console.errors(), &["invalid password".to_string()]);
    }

    #[test]
    fn verification_needs_a_well_formed_digest() {
        let mut store = MemoryStore::new();
        let mut console = ScriptedConsole::new(["oldpass1"]);
        assert!(matches!(
            verify_existing_password(&store, &mut console, &policy(), b"x", &vars::MOK_AUTH),
            Err(MokError::Store { .. })
        ));

        store.insert(&vars::MOK_AUTH, vec![0; 31]);
        assert!(matches!(
            verify_existing_password(&store, &mut console, &policy(), b"x", &vars::MOK_AUTH),
            Err(MokError::Malformed { .. })
        ));
        assert!(console.prompts().is_empty());
    }
}
