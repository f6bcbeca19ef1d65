//! Disk creation parameters.
//!
//! [`DiskCreationParameters`] collects what the caller wants; [`build`]
//! validates it into an immutable [`DiskCreationRequest`], which is the only
//! thing that can be submitted to a [`DiskBackend`].
//!
//! [`build`]: DiskCreationParameters::build

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;
use vhdkit_shared::constants::disk::{
    DEFAULT_BLOCK_SIZE, DISK_SECTOR_SIZE, SECURITY_DESCRIPTOR_REVISION,
};
use vhdkit_shared::constants::status::{ERROR_INVALID_HANDLE, ERROR_IO_PENDING, is_accepted};
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use super::types::{
    CompletionToken, CreateVirtualDiskFlags, CreateVirtualDiskParameters,
    CreateVirtualDiskVersion, OpenVirtualDiskFlags, VirtualDiskAccessMask,
    VirtualStorageDeviceType, VirtualStorageType,
};
use super::virtual_disk::VirtualDisk;
use crate::native::{
    Acquisition, CreateVirtualDiskCall, DiskBackend, DiskKind, HandleKind, NativeHandle,
};

/// How backing storage is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationMode {
    /// Dynamically expanding: storage is allocated on first write.
    Sparse,
    /// All storage is allocated when the disk is created.
    Fixed,
}

impl AllocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMode::Sparse => "sparse",
            AllocationMode::Fixed => "fixed",
        }
    }

    fn create_flags(&self) -> CreateVirtualDiskFlags {
        match self {
            AllocationMode::Sparse => CreateVirtualDiskFlags::NONE,
            AllocationMode::Fixed => CreateVirtualDiskFlags::FULL_PHYSICAL_ALLOCATION,
        }
    }
}

/// Outcome of an accepted create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    /// The disk exists on return.
    Completed,
    /// Queued against a completion token; not awaited.
    Pending,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for a virtual disk creation request.
#[derive(Debug, Clone)]
pub struct DiskCreationParameters {
    device_type: VirtualStorageDeviceType,
    path: PathBuf,
    size_bytes: u64,
    overwrite: bool,
    allocation: AllocationMode,
    source_path: Option<PathBuf>,
    parent_path: Option<PathBuf>,
    block_size_bytes: u32,
    sector_size_bytes: u32,
    completion_token: Option<CompletionToken>,
}

impl DiskCreationParameters {
    /// Sparse disk with default geometry.
    ///
    /// Sparse VHD gets [`DEFAULT_BLOCK_SIZE`]; everything else leaves the
    /// block size to the driver.
    pub fn sparse(
        device_type: VirtualStorageDeviceType,
        path: impl Into<PathBuf>,
        size_bytes: u64,
        overwrite: bool,
    ) -> Self {
        let block_size_bytes = if device_type == VirtualStorageDeviceType::Vhd {
            DEFAULT_BLOCK_SIZE
        } else {
            0
        };
        Self::new(
            device_type,
            path.into(),
            size_bytes,
            overwrite,
            AllocationMode::Sparse,
            block_size_bytes,
        )
    }

    /// Fixed disk with default geometry.
    pub fn fixed(
        device_type: VirtualStorageDeviceType,
        path: impl Into<PathBuf>,
        size_bytes: u64,
        overwrite: bool,
    ) -> Self {
        Self::new(
            device_type,
            path.into(),
            size_bytes,
            overwrite,
            AllocationMode::Fixed,
            0,
        )
    }

    fn new(
        device_type: VirtualStorageDeviceType,
        path: PathBuf,
        size_bytes: u64,
        overwrite: bool,
        allocation: AllocationMode,
        block_size_bytes: u32,
    ) -> Self {
        Self {
            device_type,
            path,
            size_bytes,
            overwrite,
            allocation,
            source_path: None,
            parent_path: None,
            block_size_bytes,
            sector_size_bytes: DISK_SECTOR_SIZE,
            completion_token: None,
        }
    }

    /// Full-signature sparse request.
    pub fn build_sparse(
        device_type: VirtualStorageDeviceType,
        path: impl Into<PathBuf>,
        size_bytes: u64,
        overwrite: bool,
        source_path: Option<&Path>,
        block_size_bytes: u32,
        sector_size_bytes: u32,
    ) -> VhdkitResult<DiskCreationRequest> {
        let mut params = Self::sparse(device_type, path, size_bytes, overwrite)
            .block_size_bytes(block_size_bytes)
            .sector_size_bytes(sector_size_bytes);
        params.source_path = source_path.map(Path::to_path_buf);
        params.build()
    }

    /// Full-signature fixed request.
    pub fn build_fixed(
        device_type: VirtualStorageDeviceType,
        path: impl Into<PathBuf>,
        size_bytes: u64,
        overwrite: bool,
        source_path: Option<&Path>,
        block_size_bytes: u32,
        sector_size_bytes: u32,
    ) -> VhdkitResult<DiskCreationRequest> {
        let mut params = Self::fixed(device_type, path, size_bytes, overwrite)
            .block_size_bytes(block_size_bytes)
            .sector_size_bytes(sector_size_bytes);
        params.source_path = source_path.map(Path::to_path_buf);
        params.build()
    }

    /// Populate the new disk from an existing disk.
    pub fn source_path(mut self, source: impl Into<PathBuf>) -> Self {
        self.source_path = Some(source.into());
        self
    }

    /// Create a differencing disk on top of `parent`.
    pub fn parent_path(mut self, parent: impl Into<PathBuf>) -> Self {
        self.parent_path = Some(parent.into());
        self
    }

    pub fn block_size_bytes(mut self, block_size_bytes: u32) -> Self {
        self.block_size_bytes = block_size_bytes;
        self
    }

    pub fn sector_size_bytes(mut self, sector_size_bytes: u32) -> Self {
        self.sector_size_bytes = sector_size_bytes;
        self
    }

    /// Submit asynchronously; `create` then returns [`CreateStatus::Pending`]
    /// if the driver queues the request.
    pub fn completion_token(mut self, token: CompletionToken) -> Self {
        self.completion_token = Some(token);
        self
    }

    /// Validate and freeze the parameters.
    ///
    /// Checks run in a fixed order and stop at the first failure. Nothing is
    /// touched on disk.
    pub fn build(self) -> VhdkitResult<DiskCreationRequest> {
        if !self.device_type.is_creatable() {
            return Err(VhdkitError::argument(
                "device_type",
                format!("unsupported device type '{}'", self.device_type),
            ));
        }

        if self.sector_size_bytes != DISK_SECTOR_SIZE {
            return Err(VhdkitError::argument(
                "sector_size",
                format!(
                    "{} is not supported, expected {}",
                    self.sector_size_bytes, DISK_SECTOR_SIZE
                ),
            ));
        }

        if self.size_bytes % u64::from(self.sector_size_bytes) != 0 {
            return Err(VhdkitError::argument(
                "size",
                format!(
                    "{} is not a multiple of the sector size {}",
                    self.size_bytes, self.sector_size_bytes
                ),
            ));
        }

        let source_path = self.source_path.filter(|p| !p.as_os_str().is_empty());
        let parent_path = self.parent_path.filter(|p| !p.as_os_str().is_empty());

        if source_path.is_some() && parent_path.is_some() {
            return Err(VhdkitError::argument(
                "parent_path",
                "a disk cannot have both a source and a parent",
            ));
        }

        if let Some(source) = &source_path
            && !source.is_file()
        {
            return Err(VhdkitError::NotFound(source.clone()));
        }

        if let Some(parent) = &parent_path
            && !parent.is_file()
        {
            return Err(VhdkitError::NotFound(parent.clone()));
        }

        Ok(DiskCreationRequest {
            destination_path: self.path,
            max_size_bytes: self.size_bytes,
            block_size_bytes: self.block_size_bytes,
            sector_size_bytes: self.sector_size_bytes,
            source_path,
            parent_path,
            overwrite: self.overwrite,
            allocation: self.allocation,
            device_type: self.device_type,
            unique_id: Uuid::new_v4(),
            completion_token: self.completion_token,
        })
    }

    /// Build and create, releasing the disk handle on return.
    pub fn create(self, backend: Arc<dyn DiskBackend>) -> VhdkitResult<CreateStatus> {
        self.build()?.create(backend)
    }

    /// Build and create, keeping the disk handle open.
    pub fn create_with_handle(self, backend: Arc<dyn DiskBackend>) -> VhdkitResult<VirtualDisk> {
        self.build()?.create_with_handle(backend)
    }
}

// ============================================================================
// REQUEST
// ============================================================================

/// Validated, immutable description of one disk to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCreationRequest {
    destination_path: PathBuf,
    max_size_bytes: u64,
    block_size_bytes: u32,
    sector_size_bytes: u32,
    source_path: Option<PathBuf>,
    parent_path: Option<PathBuf>,
    overwrite: bool,
    allocation: AllocationMode,
    device_type: VirtualStorageDeviceType,
    unique_id: Uuid,
    completion_token: Option<CompletionToken>,
}

impl DiskCreationRequest {
    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn block_size_bytes(&self) -> u32 {
        self.block_size_bytes
    }

    pub fn sector_size_bytes(&self) -> u32 {
        self.sector_size_bytes
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn parent_path(&self) -> Option<&Path> {
        self.parent_path.as_deref()
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn allocation(&self) -> AllocationMode {
        self.allocation
    }

    pub fn device_type(&self) -> VirtualStorageDeviceType {
        self.device_type
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    pub fn completion_token(&self) -> Option<CompletionToken> {
        self.completion_token
    }

    pub fn storage_type(&self) -> VirtualStorageType {
        VirtualStorageType::microsoft(self.device_type)
    }

    /// VHD requests use version 1; VHDX uses version 2.
    pub fn version(&self) -> CreateVirtualDiskVersion {
        match self.device_type {
            VirtualStorageDeviceType::Vhd => CreateVirtualDiskVersion::Version1,
            _ => CreateVirtualDiskVersion::Version2,
        }
    }

    /// Version 2 requests only accept an empty mask.
    pub fn access_mask(&self) -> VirtualDiskAccessMask {
        match self.version() {
            CreateVirtualDiskVersion::Version1 => VirtualDiskAccessMask::ALL,
            _ => VirtualDiskAccessMask::NONE,
        }
    }

    pub fn flags(&self) -> CreateVirtualDiskFlags {
        self.allocation.create_flags()
    }

    /// Driver parameter record for this request.
    pub fn to_parameters(&self) -> CreateVirtualDiskParameters {
        CreateVirtualDiskParameters {
            version: self.version(),
            unique_id: self.unique_id,
            maximum_size: self.max_size_bytes,
            block_size_in_bytes: self.block_size_bytes,
            sector_size_in_bytes: self.sector_size_bytes,
            parent_path: self.parent_path.clone(),
            source_path: self.source_path.clone(),
            open_flags: OpenVirtualDiskFlags::NONE,
            get_info_only: false,
            parent_virtual_storage_type: VirtualStorageType::unknown(),
            source_virtual_storage_type: VirtualStorageType::unknown(),
            resiliency_guid: Uuid::nil(),
        }
    }

    /// Create the disk and release its handle, if the driver returned one.
    pub fn create(&self, backend: Arc<dyn DiskBackend>) -> VhdkitResult<CreateStatus> {
        let (mut handle, status) = self.submit(backend)?;
        handle.close()?;
        Ok(status)
    }

    /// Create the disk and hand its open handle to the caller.
    ///
    /// Fails with `Backend` if the driver accepted the request but returned
    /// no handle.
    pub fn create_with_handle(&self, backend: Arc<dyn DiskBackend>) -> VhdkitResult<VirtualDisk> {
        let (handle, status) = self.submit(backend)?;
        if !handle.is_valid() {
            return Err(VhdkitError::backend(
                DiskKind::OPEN_OPERATION,
                ERROR_INVALID_HANDLE,
            ));
        }
        Ok(VirtualDisk::new(
            handle,
            self.destination_path.clone(),
            self.device_type,
            self.allocation,
            status,
        ))
    }

    fn submit(
        &self,
        backend: Arc<dyn DiskBackend>,
    ) -> VhdkitResult<(NativeHandle<DiskKind>, CreateStatus)> {
        if self.overwrite && self.destination_path.exists() {
            tracing::debug!(
                path = %self.destination_path.display(),
                "Removing existing disk before overwrite"
            );
            std::fs::remove_file(&self.destination_path)?;
        }

        let security_descriptor = backend
            .initialize_security_descriptor(SECURITY_DESCRIPTOR_REVISION)
            .ok_or(VhdkitError::SecurityInitFailed)?;

        tracing::info!(
            path = %self.destination_path.display(),
            device_type = %self.device_type,
            allocation = self.allocation.as_str(),
            size_bytes = self.max_size_bytes,
            unique_id = %self.unique_id,
            "Creating virtual disk"
        );

        let parameters = self.to_parameters();
        let call = CreateVirtualDiskCall {
            storage_type: self.storage_type(),
            path: &self.destination_path,
            access_mask: self.access_mask(),
            security_descriptor: &security_descriptor,
            flags: self.flags(),
            provider_specific_flags: 0,
            parameters: &parameters,
            overlapped: self.completion_token,
        };

        let mut code = 0;
        let handle = NativeHandle::<DiskKind>::acquire_optional(backend, |backend| {
            let outcome = backend.create_virtual_disk(&call);
            code = outcome.status;
            if is_accepted(outcome.status) {
                Acquisition::ok(outcome.handle)
            } else {
                Acquisition::failed(
                    outcome.handle,
                    VhdkitError::backend(DiskKind::OPEN_OPERATION, outcome.status),
                )
            }
        })?;

        let status = if code == ERROR_IO_PENDING {
            CreateStatus::Pending
        } else {
            CreateStatus::Completed
        };
        tracing::debug!(path = %self.destination_path.display(), ?status, "Virtual disk create accepted");
        Ok((handle, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_vhd_uses_default_block_size() {
        let request = DiskCreationParameters::sparse(
            VirtualStorageDeviceType::Vhd,
            "/tmp/a.vhd",
            0x10_0000,
            false,
        )
        .build()
        .unwrap();
        assert_eq!(request.block_size_bytes(), DEFAULT_BLOCK_SIZE);
        assert_eq!(request.version(), CreateVirtualDiskVersion::Version1);
        assert_eq!(request.access_mask(), VirtualDiskAccessMask::ALL);
        assert_eq!(request.flags(), CreateVirtualDiskFlags::NONE);
    }

    #[test]
    fn test_sparse_vhdx_leaves_block_size_to_driver() {
        let request = DiskCreationParameters::sparse(
            VirtualStorageDeviceType::Vhdx,
            "/tmp/a.vhdx",
            0x10_0000,
            false,
        )
        .build()
        .unwrap();
        assert_eq!(request.block_size_bytes(), 0);
        assert_eq!(request.version(), CreateVirtualDiskVersion::Version2);
        assert_eq!(request.access_mask(), VirtualDiskAccessMask::NONE);
    }

    #[test]
    fn test_fixed_requests_full_allocation() {
        let request = DiskCreationParameters::fixed(
            VirtualStorageDeviceType::Vhd,
            "/tmp/a.vhd",
            0x10_0000,
            false,
        )
        .build()
        .unwrap();
        assert_eq!(request.block_size_bytes(), 0);
        assert_eq!(request.flags(), CreateVirtualDiskFlags::FULL_PHYSICAL_ALLOCATION);
    }

    #[test]
    fn test_device_type_checked_before_size() {
        let err = DiskCreationParameters::sparse(VirtualStorageDeviceType::Iso, "/tmp/a", 1, false)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            VhdkitError::ArgumentInvalid {
                name: "device_type",
                ..
            }
        ));
    }

    #[test]
    fn test_unsupported_sector_size() {
        let err = DiskCreationParameters::sparse(
            VirtualStorageDeviceType::Vhdx,
            "/tmp/a.vhdx",
            4096,
            false,
        )
        .sector_size_bytes(0)
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            VhdkitError::ArgumentInvalid {
                name: "sector_size",
                ..
            }
        ));
    }

    #[test]
    fn test_source_and_parent_are_exclusive() {
        let err = DiskCreationParameters::sparse(
            VirtualStorageDeviceType::Vhdx,
            "/tmp/a.vhdx",
            512,
            false,
        )
        .source_path("/nonexistent/source.vhdx")
        .parent_path("/nonexistent/parent.vhdx")
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            VhdkitError::ArgumentInvalid {
                name: "parent_path",
                ..
            }
        ));
    }

    #[test]
    fn test_empty_source_is_ignored() {
        let request = DiskCreationParameters::sparse(
            VirtualStorageDeviceType::Vhdx,
            "/tmp/a.vhdx",
            512,
            false,
        )
        .source_path("")
        .build()
        .unwrap();
        assert!(request.source_path().is_none());
    }

    #[test]
    fn test_each_request_gets_fresh_unique_id() {
        let params =
            DiskCreationParameters::sparse(VirtualStorageDeviceType::Vhdx, "/tmp/a.vhdx", 512, false);
        let first = params.clone().build().unwrap();
        let second = params.build().unwrap();
        assert_ne!(first.unique_id(), second.unique_id());
        assert!(!first.unique_id().is_nil());
    }

    #[test]
    fn test_parameters_record_zeroes_unused_fields() {
        let request =
            DiskCreationParameters::fixed(VirtualStorageDeviceType::Vhdx, "/tmp/a.vhdx", 1024, false)
                .build()
                .unwrap();
        let params = request.to_parameters();
        assert_eq!(params.maximum_size, 1024);
        assert_eq!(params.sector_size_in_bytes, DISK_SECTOR_SIZE);
        assert_eq!(params.open_flags, OpenVirtualDiskFlags::NONE);
        assert!(!params.get_info_only);
        assert_eq!(params.parent_virtual_storage_type, VirtualStorageType::unknown());
        assert_eq!(params.source_virtual_storage_type, VirtualStorageType::unknown());
        assert!(params.resiliency_guid.is_nil());
    }
}
