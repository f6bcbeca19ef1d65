//! Windows backends: `virtdisk.dll` for disk creation and `wimgapi.dll` for
//! archive access.
//!
//! All unsafe calls are confined to this module. Paths cross the boundary as
//! NUL-terminated UTF-16; handles cross as pointer-sized integers.

use std::ffi::{OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use uuid::Uuid;
use vhdkit_shared::constants::status::ERROR_SUCCESS;
use vhdkit_shared::constants::wim::WIM_MSG_ABORT_IMAGE;
use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::{
    InitializeSecurityDescriptor, PSECURITY_DESCRIPTOR, SECURITY_DESCRIPTOR,
};
use windows::Win32::Storage::Vhd::{
    CREATE_VIRTUAL_DISK_FLAG, CREATE_VIRTUAL_DISK_PARAMETERS, CREATE_VIRTUAL_DISK_PARAMETERS_0,
    CREATE_VIRTUAL_DISK_PARAMETERS_0_0, CREATE_VIRTUAL_DISK_PARAMETERS_0_1,
    CREATE_VIRTUAL_DISK_VERSION_1, CREATE_VIRTUAL_DISK_VERSION_2, CreateVirtualDisk,
    OPEN_VIRTUAL_DISK_FLAG, VIRTUAL_DISK_ACCESS_MASK, VIRTUAL_STORAGE_TYPE,
};
use windows::Win32::System::IO::OVERLAPPED;
use windows::core::{GUID, PCWSTR};

use super::{
    ArchiveBackend, ArchiveOpen, CreateVirtualDiskCall, CreateVirtualDiskOutcome, DiskBackend,
    RawHandle,
};
use crate::disk::{
    CreateVirtualDiskParameters, CreateVirtualDiskVersion, SecurityDescriptor, VirtualStorageType,
};
use crate::wim::{ImageMessage, MessageKind, dispatch};

const INVALID_CALLBACK_VALUE: u32 = 0xFFFF_FFFF;

// The portable descriptor is handed to the driver in place of SECURITY_DESCRIPTOR.
const _: () = assert!(size_of::<SecurityDescriptor>() == size_of::<SECURITY_DESCRIPTOR>());
const _: () = assert!(align_of::<SecurityDescriptor>() == align_of::<SECURITY_DESCRIPTOR>());

// ============================================================================
// WIMGAPI BINDINGS
// ============================================================================

// wimgapi.h is not part of the Win32 metadata the `windows` crate is
// generated from, so these entry points are declared by hand.

type MessageProc = unsafe extern "system" fn(u32, usize, isize, *mut c_void) -> u32;

#[link(name = "wimgapi")]
unsafe extern "system" {
    fn WIMCreateFile(
        path: PCWSTR,
        desired_access: u32,
        creation_disposition: u32,
        flags_and_attributes: u32,
        compression_type: u32,
        creation_result: *mut u32,
    ) -> HANDLE;
    fn WIMCloseHandle(handle: HANDLE) -> i32;
    fn WIMSetTemporaryPath(handle: HANDLE, path: PCWSTR) -> i32;
    fn WIMGetImageCount(handle: HANDLE) -> u32;
    fn WIMLoadImage(handle: HANDLE, index: u32) -> HANDLE;
    fn WIMGetImageInformation(handle: HANDLE, info: *mut *mut c_void, size: *mut u32) -> i32;
    fn WIMRegisterMessageCallback(handle: HANDLE, proc_: MessageProc, user_data: *mut c_void)
    -> u32;
    fn WIMUnregisterMessageCallback(handle: HANDLE, proc_: MessageProc) -> i32;
}

// ============================================================================
// HELPERS
// ============================================================================

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn wide_opt(path: Option<&Path>) -> Option<Vec<u16>> {
    path.map(wide)
}

fn pcwstr(buffer: &Option<Vec<u16>>) -> PCWSTR {
    buffer.as_ref().map_or(PCWSTR::null(), |b| PCWSTR(b.as_ptr()))
}

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn storage_type(storage: VirtualStorageType) -> VIRTUAL_STORAGE_TYPE {
    VIRTUAL_STORAGE_TYPE {
        DeviceId: storage.device_id as u32,
        VendorId: guid(storage.vendor_id),
    }
}

fn to_handle(raw: RawHandle) -> HANDLE {
    HANDLE(raw.as_usize() as *mut c_void)
}

fn from_handle(handle: HANDLE) -> RawHandle {
    RawHandle::new(handle.0 as usize)
}

fn last_error() -> u32 {
    unsafe { GetLastError() }.0
}

fn check(ok: i32) -> Result<(), u32> {
    if ok != 0 { Ok(()) } else { Err(last_error()) }
}

/// Read a NUL-terminated UTF-16 string owned by the driver.
///
/// # Safety
///
/// `text` must be null or point to a NUL-terminated UTF-16 string that stays
/// valid for the duration of the call.
unsafe fn read_wide(text: usize) -> PathBuf {
    let text = PCWSTR(text as *const u16);
    if text.is_null() {
        return PathBuf::new();
    }
    PathBuf::from(OsString::from_wide(unsafe { text.as_wide() }))
}

/// Driver parameter record. `parent` and `source` must outlive the call it
/// is passed to.
fn create_parameters(
    params: &CreateVirtualDiskParameters,
    parent: PCWSTR,
    source: PCWSTR,
) -> CREATE_VIRTUAL_DISK_PARAMETERS {
    match params.version {
        CreateVirtualDiskVersion::Version1 => CREATE_VIRTUAL_DISK_PARAMETERS {
            Version: CREATE_VIRTUAL_DISK_VERSION_1,
            Anonymous: CREATE_VIRTUAL_DISK_PARAMETERS_0 {
                Version1: CREATE_VIRTUAL_DISK_PARAMETERS_0_0 {
                    UniqueId: guid(params.unique_id),
                    MaximumSize: params.maximum_size,
                    BlockSizeInBytes: params.block_size_in_bytes,
                    SectorSizeInBytes: params.sector_size_in_bytes,
                    ParentPath: parent,
                    SourcePath: source,
                },
            },
        },
        _ => CREATE_VIRTUAL_DISK_PARAMETERS {
            Version: CREATE_VIRTUAL_DISK_VERSION_2,
            Anonymous: CREATE_VIRTUAL_DISK_PARAMETERS_0 {
                Version2: CREATE_VIRTUAL_DISK_PARAMETERS_0_1 {
                    UniqueId: guid(params.unique_id),
                    MaximumSize: params.maximum_size,
                    BlockSizeInBytes: params.block_size_in_bytes,
                    SectorSizeInBytes: params.sector_size_in_bytes,
                    PhysicalSectorSizeInBytes: 0,
                    ParentPath: parent,
                    SourcePath: source,
                    OpenFlags: OPEN_VIRTUAL_DISK_FLAG(params.open_flags.0 as _),
                    ParentVirtualStorageType: storage_type(params.parent_virtual_storage_type),
                    SourceVirtualStorageType: storage_type(params.source_virtual_storage_type),
                    ResiliencyGuid: guid(params.resiliency_guid),
                },
            },
        },
    }
}

// ============================================================================
// DISK BACKEND
// ============================================================================

/// `virtdisk.dll` disk backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtDisk;

impl DiskBackend for VirtDisk {
    fn initialize_security_descriptor(&self, revision: u32) -> Option<SecurityDescriptor> {
        let mut descriptor = SecurityDescriptor::default();
        let result = unsafe {
            InitializeSecurityDescriptor(
                PSECURITY_DESCRIPTOR(ptr::from_mut(&mut descriptor).cast()),
                revision,
            )
        };
        result.ok().map(|()| descriptor)
    }

    fn create_virtual_disk(&self, call: &CreateVirtualDiskCall<'_>) -> CreateVirtualDiskOutcome {
        let params = call.parameters;
        let storage = storage_type(call.storage_type);
        let path = wide(call.path);
        let parent = wide_opt(params.parent_path.as_deref());
        let source = wide_opt(params.source_path.as_deref());
        let parameters = create_parameters(params, pcwstr(&parent), pcwstr(&source));

        let overlapped = call
            .overlapped
            .map(|token| token.as_usize() as *const OVERLAPPED);
        let mut handle = HANDLE::default();

        let status = unsafe {
            CreateVirtualDisk(
                &storage,
                PCWSTR(path.as_ptr()),
                VIRTUAL_DISK_ACCESS_MASK(call.access_mask.0 as _),
                Some(PSECURITY_DESCRIPTOR(
                    ptr::from_ref(call.security_descriptor).cast_mut().cast(),
                )),
                CREATE_VIRTUAL_DISK_FLAG(call.flags.0 as _),
                call.provider_specific_flags,
                &parameters,
                overlapped,
                &mut handle,
            )
        };

        CreateVirtualDiskOutcome {
            status: status.0,
            handle: from_handle(handle),
        }
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), u32> {
        unsafe { CloseHandle(to_handle(handle)) }.map_err(|_| last_error())
    }
}

// ============================================================================
// ARCHIVE BACKEND
// ============================================================================

/// `wimgapi.dll` archive backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Wimgapi;

impl ArchiveBackend for Wimgapi {
    fn create_file(&self, path: &Path, desired_access: u32, disposition: u32) -> ArchiveOpen {
        let path = wide(path);
        let mut creation_result = 0;
        let handle = unsafe {
            WIMCreateFile(
                PCWSTR(path.as_ptr()),
                desired_access,
                disposition,
                0,
                0,
                &mut creation_result,
            )
        };
        let status = if handle.is_invalid() { last_error() } else { ERROR_SUCCESS };
        ArchiveOpen {
            handle: from_handle(handle),
            creation_result,
            status,
        }
    }

    fn set_temporary_path(&self, handle: RawHandle, path: &Path) -> Result<(), u32> {
        let path = wide(path);
        check(unsafe { WIMSetTemporaryPath(to_handle(handle), PCWSTR(path.as_ptr())) })
    }

    fn image_count(&self, handle: RawHandle) -> u32 {
        unsafe { WIMGetImageCount(to_handle(handle)) }
    }

    fn load_image(&self, container: RawHandle, index: u32) -> Result<RawHandle, u32> {
        let handle = unsafe { WIMLoadImage(to_handle(container), index) };
        if handle.is_invalid() {
            Err(last_error())
        } else {
            Ok(from_handle(handle))
        }
    }

    fn image_information(&self, handle: RawHandle) -> Result<Option<Vec<u8>>, u32> {
        let mut info: *mut c_void = ptr::null_mut();
        let mut size = 0u32;
        check(unsafe { WIMGetImageInformation(to_handle(handle), &mut info, &mut size) })?;
        if info.is_null() {
            return Ok(None);
        }

        let bytes =
            unsafe { std::slice::from_raw_parts(info.cast::<u8>(), size as usize) }.to_vec();
        unsafe { LocalFree(Some(HLOCAL(info))) };
        Ok(Some(bytes))
    }

    fn register_message_callback(&self, handle: RawHandle) -> Result<(), u32> {
        let index = unsafe {
            WIMRegisterMessageCallback(
                to_handle(handle),
                message_trampoline,
                handle.as_usize() as *mut c_void,
            )
        };
        if index == INVALID_CALLBACK_VALUE {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn unregister_message_callback(&self, handle: RawHandle) -> Result<(), u32> {
        check(unsafe { WIMUnregisterMessageCallback(to_handle(handle), message_trampoline) })
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), u32> {
        check(unsafe { WIMCloseHandle(to_handle(handle)) })
    }
}

/// Entry point handed to the driver; `user_data` carries the container handle.
///
/// Called from driver threads. Must not panic.
unsafe extern "system" fn message_trampoline(
    message_id: u32,
    wparam: usize,
    lparam: isize,
    user_data: *mut c_void,
) -> u32 {
    let message = match unsafe { decode_message(message_id, wparam, lparam) } {
        Some(message) => message,
        None => ImageMessage::Unknown { id: message_id },
    };

    let result = std::panic::catch_unwind(|| dispatch(RawHandle::new(user_data as usize), &message));
    match result {
        Ok(status) => status.as_raw(),
        Err(_) => {
            tracing::error!(message_id, "Message callback panicked; aborting image");
            WIM_MSG_ABORT_IMAGE
        }
    }
}

/// # Safety
///
/// `wparam` must carry a valid string pointer for message kinds that have one.
unsafe fn decode_message(id: u32, wparam: usize, lparam: isize) -> Option<ImageMessage> {
    let message = match MessageKind::from_id(id)? {
        MessageKind::Text => {
            ImageMessage::Text(unsafe { read_wide(wparam) }.to_string_lossy().into_owned())
        }
        MessageKind::Progress => ImageMessage::Progress {
            percent: wparam as u32,
            remaining_ms: lparam as u32,
        },
        MessageKind::Process => ImageMessage::Process {
            path: unsafe { read_wide(wparam) },
        },
        MessageKind::Scanning => ImageMessage::Scanning {
            count: wparam as u32,
        },
        MessageKind::SetRange => ImageMessage::SetRange {
            count: lparam as u32,
        },
        MessageKind::SetPos => ImageMessage::SetPos {
            position: lparam as u32,
        },
        MessageKind::StepIt => ImageMessage::StepIt,
        MessageKind::Compress => ImageMessage::Compress {
            path: unsafe { read_wide(wparam) },
        },
        MessageKind::Error => ImageMessage::Error {
            path: unsafe { read_wide(wparam) },
            code: lparam as u32,
        },
        MessageKind::Alignment => ImageMessage::Alignment,
        MessageKind::Retry => ImageMessage::Retry,
        MessageKind::Split => ImageMessage::Split,
    };
    Some(message)
}
