//! Virtual disk driver types.
//!
//! Values mirror the driver ABI; field order of [`CreateVirtualDiskParameters`]
//! is the order the driver reads them in.

use std::path::PathBuf;

use uuid::Uuid;

/// Vendor id of the standard virtual disk provider.
pub const VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT: Uuid =
    Uuid::from_u128(0xEC98_4AEC_A0F9_47E9_901F_7141_5A66_345B);

/// Vendor id used when the provider is unknown.
pub const VIRTUAL_STORAGE_TYPE_VENDOR_UNKNOWN: Uuid = Uuid::nil();

/// Virtual storage device type.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VirtualStorageDeviceType {
    /// Unknown or not valid.
    #[default]
    Unknown = 0,
    /// Reserved for internal use; not supported.
    Iso = 1,
    /// Virtual hard disk, version 1.
    Vhd = 2,
    /// Virtual hard disk, version 2.
    Vhdx = 3,
}

impl VirtualStorageDeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Iso => "iso",
            Self::Vhd => "vhd",
            Self::Vhdx => "vhdx",
        }
    }

    /// Whether disks of this type can be created.
    pub fn is_creatable(&self) -> bool {
        matches!(self, Self::Vhd | Self::Vhdx)
    }
}

impl std::fmt::Display for VirtualStorageDeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type and provider of a virtual storage device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualStorageType {
    pub device_id: VirtualStorageDeviceType,
    pub vendor_id: Uuid,
}

impl VirtualStorageType {
    /// All-zero storage type (unknown device, unknown vendor).
    pub const fn unknown() -> Self {
        Self {
            device_id: VirtualStorageDeviceType::Unknown,
            vendor_id: VIRTUAL_STORAGE_TYPE_VENDOR_UNKNOWN,
        }
    }

    /// Storage type served by the standard provider.
    pub const fn microsoft(device_id: VirtualStorageDeviceType) -> Self {
        Self {
            device_id,
            vendor_id: VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
        }
    }
}

impl Default for VirtualStorageType {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Version of the create parameters record.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateVirtualDiskVersion {
    #[default]
    Unspecified = 0,
    Version1 = 1,
    Version2 = 2,
}

/// Access rights requested on the created disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VirtualDiskAccessMask(pub u32);

impl VirtualDiskAccessMask {
    /// Only accepted by version 2 requests.
    pub const NONE: Self = Self(0x0000_0000);
    pub const ATTACH_READ_ONLY: Self = Self(0x0001_0000);
    pub const ATTACH_READ_WRITE: Self = Self(0x0002_0000);
    pub const DETACH: Self = Self(0x0004_0000);
    pub const GET_INFO: Self = Self(0x0008_0000);
    pub const CREATE: Self = Self(0x0010_0000);
    pub const META_OPERATIONS: Self = Self(0x0020_0000);
    pub const READ: Self = Self(0x000D_0000);
    pub const ALL: Self = Self(0x003F_0000);
    pub const WRITABLE: Self = Self(0x0032_0000);
}

/// Creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CreateVirtualDiskFlags(pub u32);

impl CreateVirtualDiskFlags {
    pub const NONE: Self = Self(0x0000_0000);
    /// Pre-allocate all physical space (fixed disks).
    pub const FULL_PHYSICAL_ALLOCATION: Self = Self(0x0000_0001);
}

/// Open flags carried inside the create parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenVirtualDiskFlags(pub u32);

impl OpenVirtualDiskFlags {
    pub const NONE: Self = Self(0x0000_0000);
    /// Open without differencing-chain parents.
    pub const NO_PARENTS: Self = Self(0x0000_0001);
    pub const BLANK_FILE: Self = Self(0x0000_0002);
    pub const BOOT_DRIVE: Self = Self(0x0000_0004);
}

/// Create parameters, in driver field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVirtualDiskParameters {
    pub version: CreateVirtualDiskVersion,
    /// Identifier assigned to the new disk. Nil lets the driver pick one.
    pub unique_id: Uuid,
    /// Must be a multiple of 512. Zero with a parent or source means "same size".
    pub maximum_size: u64,
    /// Zero selects the driver default; must be zero for fixed VHD.
    pub block_size_in_bytes: u32,
    pub sector_size_in_bytes: u32,
    pub parent_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub open_flags: OpenVirtualDiskFlags,
    pub get_info_only: bool,
    pub parent_virtual_storage_type: VirtualStorageType,
    pub source_virtual_storage_type: VirtualStorageType,
    /// Fallback resiliency id for SMB-hosted disks.
    pub resiliency_guid: Uuid,
}

/// Absolute security descriptor as laid out by the OS.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityDescriptor {
    pub revision: u8,
    pub sbz1: u8,
    pub control: u16,
    pub owner: usize,
    pub group: usize,
    pub sacl: usize,
    pub dacl: usize,
}

/// Completion token for an overlapped (asynchronous) create.
///
/// When present, the driver may return `ERROR_IO_PENDING`; waiting for
/// completion is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(usize);

impl CompletionToken {
    /// Returns `None` for a null token.
    pub fn new(value: usize) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_id_matches_provider_guid() {
        assert_eq!(
            VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT.to_string(),
            "ec984aec-a0f9-47e9-901f-71415a66345b"
        );
        assert!(VIRTUAL_STORAGE_TYPE_VENDOR_UNKNOWN.is_nil());
    }

    #[test]
    fn test_only_vhd_and_vhdx_are_creatable() {
        assert!(VirtualStorageDeviceType::Vhd.is_creatable());
        assert!(VirtualStorageDeviceType::Vhdx.is_creatable());
        assert!(!VirtualStorageDeviceType::Iso.is_creatable());
        assert!(!VirtualStorageDeviceType::Unknown.is_creatable());
    }

    #[test]
    fn test_device_type_discriminants() {
        assert_eq!(VirtualStorageDeviceType::Vhd as i32, 2);
        assert_eq!(VirtualStorageDeviceType::Vhdx as i32, 3);
    }

    #[test]
    fn test_null_completion_token() {
        assert!(CompletionToken::new(0).is_none());
        assert_eq!(CompletionToken::new(0x1000).unwrap().as_usize(), 0x1000);
    }
}
