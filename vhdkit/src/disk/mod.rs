//! Virtual disk creation.
//!
//! This module provides VHD/VHDX creation on top of a [`DiskBackend`]:
//! - `DiskCreationParameters` - Validating builder for sparse and fixed disks
//! - `DiskCreationRequest` - Immutable, validated request
//! - `VirtualDisk` - Created disk with its driver handle kept open
//! - Driver types (`VirtualStorageType`, `CreateVirtualDiskParameters`, flags)
//!
//! [`DiskBackend`]: crate::native::DiskBackend

mod params;
mod types;
mod virtual_disk;

pub use params::{AllocationMode, CreateStatus, DiskCreationParameters, DiskCreationRequest};
pub use types::{
    CompletionToken, CreateVirtualDiskFlags, CreateVirtualDiskParameters,
    CreateVirtualDiskVersion, OpenVirtualDiskFlags, SecurityDescriptor, VirtualDiskAccessMask,
    VirtualStorageDeviceType, VirtualStorageType, VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
    VIRTUAL_STORAGE_TYPE_VENDOR_UNKNOWN,
};
pub use virtual_disk::VirtualDisk;
