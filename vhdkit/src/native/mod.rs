//! Native backend boundary.
//!
//! Everything that talks to the platform disk driver or archive reader goes
//! through one of the two backend traits defined here. The library never calls
//! a driver directly; it hands a backend the fully assembled request and gets
//! back a status code and/or a raw handle, which it immediately wraps in a
//! [`NativeHandle`] so release is deterministic.
//!
//! ## Module Structure
//!
//! - `handle` - `NativeHandle<K>` scoped ownership wrapper and the handle kinds
//! - `windows` - `virtdisk.dll` / `wimgapi.dll` backends (Windows only)

mod handle;
#[cfg(windows)]
pub mod windows;

use std::path::Path;

use crate::disk::{
    CompletionToken, CreateVirtualDiskFlags, CreateVirtualDiskParameters, SecurityDescriptor,
    VirtualDiskAccessMask, VirtualStorageType,
};

pub use handle::{Acquisition, ContainerKind, DiskKind, HandleKind, ImageKind, NativeHandle};

/// Opaque handle value produced by a backend.
///
/// Zero and all-ones are treated as "no handle", matching the two invalid
/// sentinels native drivers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(usize);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);
    pub const INVALID: RawHandle = RawHandle(usize::MAX);

    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0 || self.0 == usize::MAX
    }
}

impl std::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// DISK BACKEND
// ============================================================================

/// Everything a create-virtual-disk call receives, in driver order.
#[derive(Debug)]
pub struct CreateVirtualDiskCall<'a> {
    pub storage_type: VirtualStorageType,
    pub path: &'a Path,
    pub access_mask: VirtualDiskAccessMask,
    pub security_descriptor: &'a SecurityDescriptor,
    pub flags: CreateVirtualDiskFlags,
    pub provider_specific_flags: u32,
    pub parameters: &'a CreateVirtualDiskParameters,
    pub overlapped: Option<CompletionToken>,
}

/// Status and handle returned by a create-virtual-disk call.
///
/// A driver may hand back a handle even when the status reports failure;
/// callers must release it either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateVirtualDiskOutcome {
    pub status: u32,
    pub handle: RawHandle,
}

/// Virtual disk driver.
pub trait DiskBackend: Send + Sync {
    /// Initialize an empty security descriptor so the new disk inherits the
    /// security of its parent directory. `None` means initialization failed.
    fn initialize_security_descriptor(&self, revision: u32) -> Option<SecurityDescriptor>;

    /// Submit a create request.
    fn create_virtual_disk(&self, call: &CreateVirtualDiskCall<'_>) -> CreateVirtualDiskOutcome;

    /// Release a disk handle.
    fn close_handle(&self, handle: RawHandle) -> Result<(), u32>;
}

// ============================================================================
// ARCHIVE BACKEND
// ============================================================================

/// Result of opening an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveOpen {
    pub handle: RawHandle,
    /// `WIM_CREATED_NEW` or `WIM_OPENED_EXISTING`.
    pub creation_result: u32,
    /// Last error reported by the driver (meaningful when `handle` is null).
    pub status: u32,
}

/// Archive (WIM) reader.
pub trait ArchiveBackend: Send + Sync {
    fn create_file(&self, path: &Path, desired_access: u32, disposition: u32) -> ArchiveOpen;

    fn set_temporary_path(&self, handle: RawHandle, path: &Path) -> Result<(), u32>;

    /// Number of images in an open archive.
    fn image_count(&self, handle: RawHandle) -> u32;

    /// Load the image at a 1-based index.
    fn load_image(&self, container: RawHandle, index: u32) -> Result<RawHandle, u32>;

    /// Raw metadata for a container or image handle: UTF-16LE text starting
    /// with a byte-order marker. `Ok(None)` when the driver has no data.
    fn image_information(&self, handle: RawHandle) -> Result<Option<Vec<u8>>, u32>;

    /// Route messages for `handle` to [`crate::wim::dispatch`].
    fn register_message_callback(&self, handle: RawHandle) -> Result<(), u32>;

    fn unregister_message_callback(&self, handle: RawHandle) -> Result<(), u32>;

    fn close_handle(&self, handle: RawHandle) -> Result<(), u32>;
}
