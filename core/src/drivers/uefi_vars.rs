//! UEFI Variables
//!
//! Naming and access contract for firmware-resident variables.
//! Backends live next to this module (`efivarfs`, `memory`); everything
//! above the driver layer only sees the `VariableStore` trait.

use std::fmt;

use bitflags::bitflags;

use crate::util::StoreError;

/// EFI GUID, stored in the mixed-endian wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EfiGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl EfiGuid {
    pub const SIZE: usize = 16;

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }

    /// Decode the first 16 bytes of `data`.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let raw: &[u8; 16] = data.get(..Self::SIZE)?.try_into().ok()?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&raw[8..16]);
        Some(Self {
            data1: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data2: u16::from_le_bytes([raw[4], raw[5]]),
            data3: u16::from_le_bytes([raw[6], raw[7]]),
            data4,
        })
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl fmt::Display for EfiGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

/// Well-known UEFI GUIDs
pub mod guids {
    use super::EfiGuid;

    /// EFI Global Variable GUID: 8BE4DF61-93CA-11D2-AA0D-00E098032B8C
    pub const EFI_GLOBAL_VARIABLE: EfiGuid = EfiGuid::new(
        0x8BE4DF61, 0x93CA, 0x11D2,
        [0xAA, 0x0D, 0x00, 0xE0, 0x98, 0x03, 0x2B, 0x8C],
    );

    /// EFI Image Security Database GUID: D719B2CB-3D3A-4596-A3BC-DAD00E67656F
    pub const EFI_IMAGE_SECURITY_DATABASE: EfiGuid = EfiGuid::new(
        0xD719B2CB, 0x3D3A, 0x4596,
        [0xA3, 0xBC, 0xDA, 0xD0, 0x0E, 0x67, 0x65, 0x6F],
    );

    /// Shim lock GUID: 605DAB50-E046-4300-ABB6-3DD810DD8B23.
    /// Namespace of every MOK variable and owner of entries we build.
    pub const SHIM_LOCK_GUID: EfiGuid = EfiGuid::new(
        0x605DAB50, 0xE046, 0x4300,
        [0xAB, 0xB6, 0x3D, 0xD8, 0x10, 0xDD, 0x8B, 0x23],
    );

    /// Certificate X.509 GUID
    pub const EFI_CERT_X509_GUID: EfiGuid = EfiGuid::new(
        0xA5C059A1, 0x94E4, 0x4AA7,
        [0x87, 0xB5, 0xAB, 0x15, 0x5C, 0x2B, 0xF0, 0x72],
    );

    /// Certificate SHA256 GUID
    pub const EFI_CERT_SHA256_GUID: EfiGuid = EfiGuid::new(
        0xC1C41626, 0x504C, 0x4092,
        [0xAC, 0xA9, 0x41, 0xF9, 0x36, 0x93, 0x43, 0x28],
    );
}

bitflags! {
    /// Variable attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarAttributes: u32 {
        /// Variable is non-volatile (persists across reboots)
        const NON_VOLATILE = 0x0000_0001;
        /// Variable is accessible during boot services
        const BOOTSERVICE_ACCESS = 0x0000_0002;
        /// Variable is accessible during runtime services
        const RUNTIME_ACCESS = 0x0000_0004;
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x0000_0020;
        const APPEND_WRITE = 0x0000_0040;

        /// Attributes of every variable this crate writes.
        const NV_BS_RT = Self::NON_VOLATILE.bits()
            | Self::BOOTSERVICE_ACCESS.bits()
            | Self::RUNTIME_ACCESS.bits();
    }
}

/// A (name, namespace) pair naming one firmware variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub name: &'static str,
    pub guid: EfiGuid,
}

impl VarRef {
    pub const fn new(name: &'static str, guid: EfiGuid) -> Self {
        Self { name, guid }
    }

    pub const fn shim(name: &'static str) -> Self {
        Self::new(name, guids::SHIM_LOCK_GUID)
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Variables produced or consumed by the MOK subsystem.
pub mod vars {
    use super::{guids, VarRef};

    pub const MOK_NEW: VarRef = VarRef::shim("MokNew");
    pub const MOK_AUTH: VarRef = VarRef::shim("MokAuth");
    pub const MOK_DEL: VarRef = VarRef::shim("MokDel");
    pub const MOK_DEL_AUTH: VarRef = VarRef::shim("MokDelAuth");
    pub const MOK_LIST_RT: VarRef = VarRef::shim("MokListRT");
    pub const MOK_PW: VarRef = VarRef::shim("MokPW");
    pub const MOK_SB: VarRef = VarRef::shim("MokSB");

    pub const PK: VarRef = VarRef::new("PK", guids::EFI_GLOBAL_VARIABLE);
    pub const KEK: VarRef = VarRef::new("KEK", guids::EFI_GLOBAL_VARIABLE);
    pub const DB: VarRef = VarRef::new("db", guids::EFI_IMAGE_SECURITY_DATABASE);
    pub const SECURE_BOOT: VarRef = VarRef::new("SecureBoot", guids::EFI_GLOBAL_VARIABLE);
}

/// Access to firmware variables.
///
/// `delete` is idempotent: removing a missing variable succeeds.
pub trait VariableStore {
    fn exists(&self, var: &VarRef) -> bool;

    fn read(&self, var: &VarRef) -> Result<Vec<u8>, StoreError>;

    fn write(&mut self, var: &VarRef, data: &[u8], attrs: VarAttributes) -> Result<(), StoreError>;

    fn delete(&mut self, var: &VarRef) -> Result<(), StoreError>;
}

impl<S: VariableStore + ?Sized> VariableStore for &mut S {
    fn exists(&self, var: &VarRef) -> bool {
        (**self).exists(var)
    }

    fn read(&self, var: &VarRef) -> Result<Vec<u8>, StoreError> {
        (**self).read(var)
    }

    fn write(&mut self, var: &VarRef, data: &[u8], attrs: VarAttributes) -> Result<(), StoreError> {
        (**self).write(var, data, attrs)
    }

    fn delete(&mut self, var: &VarRef) -> Result<(), StoreError> {
        (**self).delete(var)
    }
}
