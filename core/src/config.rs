//! Runtime configuration.

use std::path::PathBuf;

use crate::drivers::efivarfs::DEFAULT_EFIVARFS_ROOT;
use crate::security::password::PASSWORD_MAX;
use crate::util::{MokError, MokResult};

/// MOK manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MokConfig {
    /// efivarfs mount point
    pub efivarfs_root: PathBuf,
    /// Minimum password length, in UTF-16 code units
    pub min_password_length: usize,
    /// Maximum password length, in UTF-16 code units
    pub max_password_length: usize,
    /// Tries allowed at each password prompt
    pub password_attempts: u32,
    /// Where `export` writes `MOK-NNNN.der`
    pub export_dir: PathBuf,
}

impl Default for MokConfig {
    fn default() -> Self {
        Self {
            efivarfs_root: PathBuf::from(DEFAULT_EFIVARFS_ROOT),
            min_password_length: 8,
            max_password_length: PASSWORD_MAX,
            password_attempts: 3,
            export_dir: PathBuf::from("."),
        }
    }
}

impl MokConfig {
    pub fn validate(&self) -> MokResult<()> {
        if self.min_password_length == 0 {
            return Err(MokError::Config("minimum password length must be positive".into()));
        }
        if self.min_password_length > self.max_password_length {
            return Err(MokError::Config(format!(
                "minimum password length {} exceeds maximum {}",
                self.min_password_length, self.max_password_length
            )));
        }
        // The firmware stores at most PASSWORD_MAX code units.
        if self.max_password_length > PASSWORD_MAX {
            return Err(MokError::Config(format!(
                "maximum password length is capped at {}",
                PASSWORD_MAX
            )));
        }
        if self.password_attempts == 0 {
            return Err(MokError::Config("password attempts must be at least 1".into()));
        }
        Ok(())
    }
}
