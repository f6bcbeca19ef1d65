//! Handle to a freshly created virtual disk.

use std::path::{Path, PathBuf};

use vhdkit_shared::errors::VhdkitResult;

use super::params::{AllocationMode, CreateStatus};
use super::types::VirtualStorageDeviceType;
use crate::native::{DiskKind, NativeHandle, RawHandle};

/// A created virtual disk whose driver handle is still open.
///
/// The handle is released on [`close`](Self::close) or drop. The disk file
/// itself is left in place either way.
#[derive(Debug)]
pub struct VirtualDisk {
    handle: NativeHandle<DiskKind>,
    path: PathBuf,
    device_type: VirtualStorageDeviceType,
    allocation: AllocationMode,
    status: CreateStatus,
}

impl VirtualDisk {
    pub(crate) fn new(
        handle: NativeHandle<DiskKind>,
        path: PathBuf,
        device_type: VirtualStorageDeviceType,
        allocation: AllocationMode,
        status: CreateStatus,
    ) -> Self {
        Self {
            handle,
            path,
            device_type,
            allocation,
            status,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_type(&self) -> VirtualStorageDeviceType {
        self.device_type
    }

    pub fn allocation(&self) -> AllocationMode {
        self.allocation
    }

    /// Whether creation had finished when the handle was returned.
    pub fn status(&self) -> CreateStatus {
        self.status
    }

    /// Raw driver handle, `None` once closed.
    pub fn raw_handle(&self) -> Option<RawHandle> {
        self.handle.raw()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Release the driver handle. Safe to call more than once.
    pub fn close(&mut self) -> VhdkitResult<()> {
        if self.handle.is_valid() {
            tracing::debug!(path = %self.path.display(), "Closing virtual disk handle");
        }
        self.handle.close()
    }
}
