//! efivarfs-backed variable store.
//!
//! Each variable is a file `<Name>-<guid>` under the mount point whose
//! content is a little-endian attribute word followed by the data. The
//! kernel marks most of these files immutable, so writes and deletes clear
//! the flag first.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::uefi_vars::{VarAttributes, VarRef, VariableStore};
use crate::util::StoreError;

pub const DEFAULT_EFIVARFS_ROOT: &str = "/sys/firmware/efi/efivars";

const ATTR_WORD: usize = 4;

#[derive(Debug, Clone)]
pub struct EfivarfsStore {
    root: PathBuf,
}

impl EfivarfsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, var: &VarRef) -> PathBuf {
        self.root.join(format!("{}-{}", var.name, var.guid))
    }

    /// Read the attribute word and data of a variable.
    pub fn read_with_attributes(&self, var: &VarRef) -> Result<(VarAttributes, Vec<u8>), StoreError> {
        let mut raw = Vec::new();
        File::open(self.path_of(var))
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(StoreError::from_io)?;

        if raw.len() < ATTR_WORD {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "variable shorter than its attribute word",
            )));
        }
        let data = raw.split_off(ATTR_WORD);
        let attrs = VarAttributes::from_bits_retain(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        Ok((attrs, data))
    }
}

impl Default for EfivarfsStore {
    fn default() -> Self {
        Self::new(DEFAULT_EFIVARFS_ROOT)
    }
}

impl VariableStore for EfivarfsStore {
    fn exists(&self, var: &VarRef) -> bool {
        self.path_of(var).exists()
    }

    fn read(&self, var: &VarRef) -> Result<Vec<u8>, StoreError> {
        self.read_with_attributes(var).map(|(_, data)| data)
    }

    fn write(&mut self, var: &VarRef, data: &[u8], attrs: VarAttributes) -> Result<(), StoreError> {
        let path = self.path_of(var);
        if path.exists() {
            clear_immutable(&path);
        }

        // efivarfs wants attributes and data in a single write.
        let mut buf = Vec::with_capacity(ATTR_WORD + data.len());
        buf.extend_from_slice(&attrs.bits().to_le_bytes());
        buf.extend_from_slice(data);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(StoreError::from_io)?;
        file.write_all(&buf).map_err(StoreError::from_io)?;
        debug!("efivarfs: wrote {} ({} bytes)", var.name, data.len());
        Ok(())
    }

    fn delete(&mut self, var: &VarRef) -> Result<(), StoreError> {
        let path = self.path_of(var);
        if !path.exists() {
            return Ok(());
        }
        clear_immutable(&path);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("efivarfs: deleted {}", var.name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from_io(e)),
        }
    }
}

#[cfg(target_os = "linux")]
fn clear_immutable(path: &Path) {
    use std::os::unix::io::AsRawFd;

    const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

    let Ok(file) = File::open(path) else {
        return;
    };
    let fd = file.as_raw_fd();
    let mut flags: libc::c_int = 0;

    // SAFETY: fd is open for the lifetime of `file`; the ioctl writes one int.
    let got = unsafe { libc::ioctl(fd, libc::FS_IOC_GETFLAGS, &mut flags as *mut libc::c_int) };
    if got != 0 || flags & FS_IMMUTABLE_FL == 0 {
        return;
    }

    flags &= !FS_IMMUTABLE_FL;
    // SAFETY: as above, the ioctl reads one int.
    let set = unsafe { libc::ioctl(fd, libc::FS_IOC_SETFLAGS, &flags as *const libc::c_int) };
    if set != 0 {
        debug!(
            "efivarfs: could not clear immutable flag on {}: {}",
            path.display(),
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn clear_immutable(_path: &Path) {}
