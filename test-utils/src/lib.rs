//! In-memory backends and fixtures for vhdkit integration tests.
//!
//! - `RecordingDiskBackend` - records every create call and handle release
//! - `FakeArchiveBackend` - serves archive/image metadata from fixtures and
//!   logs every backend call in order
//! - `ImageFixture` - builds `<IMAGE>` metadata documents

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tempfile::TempDir;
use vhdkit::disk::{
    CompletionToken, CreateVirtualDiskFlags, CreateVirtualDiskParameters, SecurityDescriptor,
    VirtualDiskAccessMask, VirtualStorageType,
};
use vhdkit::native::{
    ArchiveBackend, ArchiveOpen, CreateVirtualDiskCall, CreateVirtualDiskOutcome, DiskBackend,
    RawHandle,
};
use vhdkit::wim::{ImageMessage, MessageStatus, dispatch};
use vhdkit_shared::constants::status::{ERROR_INVALID_HANDLE, ERROR_SUCCESS};
use vhdkit_shared::constants::wim::WIM_OPENED_EXISTING;


// Handles are unique across every fake in the process, since the callback
// table is process-wide.
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x1000);

fn next_handle() -> RawHandle {
    RawHandle::new(NEXT_HANDLE.fetch_add(4, Ordering::Relaxed))
}

/// Encode `xml` the way the archive driver returns metadata: UTF-16LE with a
/// leading byte-order mark.
pub fn encode_document(xml: &str) -> Vec<u8> {
    std::iter::once(0xFEFF_u16)
        .chain(xml.encode_utf16())
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Create an (empty) archive file so path checks pass.
pub fn archive_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"MSWIM\0\0\0").expect("Failed to write archive placeholder");
    path
}

// ============================================================================
// DISK BACKEND
// ============================================================================

/// One create call as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedCreate {
    pub storage_type: VirtualStorageType,
    pub path: PathBuf,
    pub access_mask: VirtualDiskAccessMask,
    pub security_descriptor: SecurityDescriptor,
    pub flags: CreateVirtualDiskFlags,
    pub provider_specific_flags: u32,
    pub parameters: CreateVirtualDiskParameters,
    pub overlapped: Option<CompletionToken>,
    /// Whether the destination existed when the call arrived.
    pub existed: bool,
}

#[derive(Default)]
struct DiskState {
    security_calls: Vec<u32>,
    creates: Vec<RecordedCreate>,
    issued: Vec<RawHandle>,
    closed: Vec<RawHandle>,
}

/// Disk backend that records calls and returns a configurable status.
pub struct RecordingDiskBackend {
    status: u32,
    null_handle: bool,
    security_ok: bool,
    write_files: bool,
    state: Mutex<DiskState>,
}

impl Default for RecordingDiskBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDiskBackend {
    /// Succeeds every call and writes an empty file at the destination.
    pub fn new() -> Self {
        Self {
            status: ERROR_SUCCESS,
            null_handle: false,
            security_ok: true,
            write_files: true,
            state: Mutex::new(DiskState::default()),
        }
    }

    /// Status returned by every create call. A handle is still issued.
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    /// Return a null handle from create calls.
    pub fn with_null_handle(mut self) -> Self {
        self.null_handle = true;
        self
    }

    pub fn with_failing_security(mut self) -> Self {
        self.security_ok = false;
        self
    }

    pub fn creates(&self) -> Vec<RecordedCreate> {
        self.state.lock().creates.clone()
    }

    pub fn security_calls(&self) -> Vec<u32> {
        self.state.lock().security_calls.clone()
    }

    pub fn issued(&self) -> Vec<RawHandle> {
        self.state.lock().issued.clone()
    }

    pub fn closed(&self) -> Vec<RawHandle> {
        self.state.lock().closed.clone()
    }
}

impl DiskBackend for RecordingDiskBackend {
    fn initialize_security_descriptor(&self, revision: u32) -> Option<SecurityDescriptor> {
        self.state.lock().security_calls.push(revision);
        self.security_ok.then(|| SecurityDescriptor {
            revision: revision as u8,
            ..Default::default()
        })
    }

    fn create_virtual_disk(&self, call: &CreateVirtualDiskCall<'_>) -> CreateVirtualDiskOutcome {
        let existed = call.path.exists();
        if self.write_files && self.status == ERROR_SUCCESS {
            let _ = std::fs::write(call.path, b"");
        }

        let handle = if self.null_handle {
            RawHandle::NULL
        } else {
            next_handle()
        };

        let mut state = self.state.lock();
        state.creates.push(RecordedCreate {
            storage_type: call.storage_type,
            path: call.path.to_path_buf(),
            access_mask: call.access_mask,
            security_descriptor: *call.security_descriptor,
            flags: call.flags,
            provider_specific_flags: call.provider_specific_flags,
            parameters: call.parameters.clone(),
            overlapped: call.overlapped,
            existed,
        });
        if !handle.is_null() {
            state.issued.push(handle);
        }

        CreateVirtualDiskOutcome {
            status: self.status,
            handle,
        }
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), u32> {
        self.state.lock().closed.push(handle);
        Ok(())
    }
}

// ============================================================================
// ARCHIVE BACKEND
// ============================================================================

/// Backend call observed by [`FakeArchiveBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    Opened(RawHandle),
    TempPath(RawHandle, PathBuf),
    Loaded {
        container: RawHandle,
        index: u32,
        handle: RawHandle,
    },
    InfoFetched(RawHandle),
    CallbackRegistered(RawHandle),
    CallbackUnregistered(RawHandle),
    Closed(RawHandle),
}

#[derive(Default)]
struct ArchiveState {
    containers: HashSet<RawHandle>,
    images: HashMap<RawHandle, usize>,
    callbacks: HashSet<RawHandle>,
    events: Vec<ArchiveEvent>,
}

/// Archive backend serving metadata from strings.
pub struct FakeArchiveBackend {
    container_xml: Option<String>,
    image_xml: Vec<Option<String>>,
    count_override: Mutex<Option<u32>>,
    creation_result: u32,
    open_status: u32,
    null_open: bool,
    load_error: Option<u32>,
    info_error: Option<u32>,
    register_error: Option<u32>,
    temp_path_error: Option<u32>,
    state: Mutex<ArchiveState>,
}

impl FakeArchiveBackend {
    /// Archive whose container document lists the fixtures, indexed from 1.
    pub fn from_fixtures(images: &[ImageFixture]) -> Self {
        let images: Vec<ImageFixture> = images
            .iter()
            .enumerate()
            .map(|(i, image)| image.clone().index(i as u32 + 1))
            .collect();
        let total: u64 = images.iter().filter_map(|image| image.total_bytes).sum();

        let mut container = format!("<WIM><TOTALBYTES>{total}</TOTALBYTES>");
        for image in &images {
            container.push_str(&image.to_xml());
        }
        container.push_str("</WIM>");

        Self::new(
            Some(container),
            images.iter().map(|image| Some(image.to_xml())).collect(),
        )
    }

    /// Archive with raw documents. `None` means the driver has no data.
    pub fn new(container_xml: Option<String>, image_xml: Vec<Option<String>>) -> Self {
        Self {
            container_xml,
            image_xml,
            count_override: Mutex::new(None),
            creation_result: WIM_OPENED_EXISTING,
            open_status: ERROR_SUCCESS,
            null_open: false,
            load_error: None,
            info_error: None,
            register_error: None,
            temp_path_error: None,
            state: Mutex::new(ArchiveState::default()),
        }
    }

    /// Report `count` images regardless of the fixtures.
    pub fn with_image_count(self, count: u32) -> Self {
        self.set_image_count(count);
        self
    }

    /// Change the reported image count of an archive that is already open.
    pub fn set_image_count(&self, count: u32) {
        *self.count_override.lock() = Some(count);
    }

    /// Creation result reported by open, with a handle still issued.
    pub fn with_creation_result(mut self, creation_result: u32, status: u32) -> Self {
        self.creation_result = creation_result;
        self.open_status = status;
        self
    }

    pub fn with_null_open(mut self, status: u32) -> Self {
        self.null_open = true;
        self.open_status = status;
        self
    }

    pub fn with_load_error(mut self, code: u32) -> Self {
        self.load_error = Some(code);
        self
    }

    pub fn with_info_error(mut self, code: u32) -> Self {
        self.info_error = Some(code);
        self
    }

    pub fn with_register_error(mut self, code: u32) -> Self {
        self.register_error = Some(code);
        self
    }

    pub fn with_temp_path_error(mut self, code: u32) -> Self {
        self.temp_path_error = Some(code);
        self
    }

    pub fn events(&self) -> Vec<ArchiveEvent> {
        self.state.lock().events.clone()
    }

    /// Handles released so far, in order.
    pub fn closed(&self) -> Vec<RawHandle> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                ArchiveEvent::Closed(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// Number of metadata fetches for `handle`.
    pub fn info_fetches(&self, handle: RawHandle) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| **event == ArchiveEvent::InfoFetched(handle))
            .count()
    }

    pub fn load_calls(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| matches!(event, ArchiveEvent::Loaded { .. }))
            .count()
    }

    /// Handles issued and not yet closed.
    pub fn open_handles(&self) -> usize {
        let state = self.state.lock();
        state.containers.len() + state.images.len()
    }

    /// Deliver `message` the way the driver would, if a callback is
    /// registered with this backend for `handle`.
    pub fn send(&self, handle: RawHandle, message: &ImageMessage) -> MessageStatus {
        if !self.state.lock().callbacks.contains(&handle) {
            return MessageStatus::Success;
        }
        dispatch(handle, message)
    }

    fn record(&self, event: ArchiveEvent) {
        self.state.lock().events.push(event);
    }
}

impl ArchiveBackend for FakeArchiveBackend {
    fn create_file(&self, _path: &Path, _desired_access: u32, _disposition: u32) -> ArchiveOpen {
        if self.null_open {
            return ArchiveOpen {
                handle: RawHandle::NULL,
                creation_result: self.creation_result,
                status: self.open_status,
            };
        }

        let handle = next_handle();
        let mut state = self.state.lock();
        state.containers.insert(handle);
        state.events.push(ArchiveEvent::Opened(handle));
        ArchiveOpen {
            handle,
            creation_result: self.creation_result,
            status: self.open_status,
        }
    }

    fn set_temporary_path(&self, handle: RawHandle, path: &Path) -> Result<(), u32> {
        self.record(ArchiveEvent::TempPath(handle, path.to_path_buf()));
        self.temp_path_error.map_or(Ok(()), Err)
    }

    fn image_count(&self, _handle: RawHandle) -> u32 {
        self.count_override
            .lock()
            .unwrap_or(self.image_xml.len() as u32)
    }

    fn load_image(&self, container: RawHandle, index: u32) -> Result<RawHandle, u32> {
        if let Some(code) = self.load_error {
            return Err(code);
        }
        let slot = (index as usize).checked_sub(1).ok_or(ERROR_INVALID_HANDLE)?;

        let handle = next_handle();
        let mut state = self.state.lock();
        if !state.containers.contains(&container) {
            return Err(ERROR_INVALID_HANDLE);
        }
        state.images.insert(handle, slot);
        state.events.push(ArchiveEvent::Loaded {
            container,
            index,
            handle,
        });
        Ok(handle)
    }

    fn image_information(&self, handle: RawHandle) -> Result<Option<Vec<u8>>, u32> {
        let mut state = self.state.lock();
        state.events.push(ArchiveEvent::InfoFetched(handle));
        if let Some(code) = self.info_error {
            return Err(code);
        }

        let xml = if state.containers.contains(&handle) {
            self.container_xml.as_deref()
        } else if let Some(slot) = state.images.get(&handle) {
            self.image_xml.get(*slot).and_then(Option::as_deref)
        } else {
            return Err(ERROR_INVALID_HANDLE);
        };
        Ok(xml.map(encode_document))
    }

    fn register_message_callback(&self, handle: RawHandle) -> Result<(), u32> {
        if let Some(code) = self.register_error {
            return Err(code);
        }
        let mut state = self.state.lock();
        state.callbacks.insert(handle);
        state.events.push(ArchiveEvent::CallbackRegistered(handle));
        Ok(())
    }

    fn unregister_message_callback(&self, handle: RawHandle) -> Result<(), u32> {
        let mut state = self.state.lock();
        state.callbacks.remove(&handle);
        state.events.push(ArchiveEvent::CallbackUnregistered(handle));
        Ok(())
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), u32> {
        let mut state = self.state.lock();
        let known = state.containers.remove(&handle) || state.images.remove(&handle).is_some();
        state.events.push(ArchiveEvent::Closed(handle));
        if known { Ok(()) } else { Err(ERROR_INVALID_HANDLE) }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Builder for one `<IMAGE>` metadata document. Unset fields are omitted.
#[derive(Debug, Clone, Default)]
pub struct ImageFixture {
    pub index: Option<u32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub flags: Option<String>,
    pub total_bytes: Option<u64>,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub arch: Option<String>,
    pub product_type: Option<String>,
    pub installation_type: Option<String>,
    pub edition_id: Option<String>,
    pub default_language: Option<String>,
    pub version: Vec<(&'static str, String)>,
}

impl ImageFixture {
    /// Fully populated Windows image.
    pub fn windows(name: &str, edition: &str) -> Self {
        Self::default()
            .name(name)
            .description(&format!("{name} description"))
            .flags(edition)
            .edition_id(edition)
            .total_bytes(8_589_934_592)
            .display_name(name)
            .display_description(&format!("{name} display description"))
            .arch("9")
            .product_type("ServerNT")
            .installation_type("Server")
            .default_language("en-US")
            .version_part("MAJOR", "10")
            .version_part("MINOR", "0")
            .version_part("BUILD", "20348")
            .version_part("SPBUILD", "587")
    }

    pub fn index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn flags(mut self, flags: &str) -> Self {
        self.flags = Some(flags.to_string());
        self
    }

    pub fn without_flags(mut self) -> Self {
        self.flags = None;
        self
    }

    pub fn total_bytes(mut self, total_bytes: u64) -> Self {
        self.total_bytes = Some(total_bytes);
        self
    }

    pub fn display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn display_description(mut self, display_description: &str) -> Self {
        self.display_description = Some(display_description.to_string());
        self
    }

    pub fn arch(mut self, arch: &str) -> Self {
        self.arch = Some(arch.to_string());
        self
    }

    pub fn product_type(mut self, product_type: &str) -> Self {
        self.product_type = Some(product_type.to_string());
        self
    }

    pub fn installation_type(mut self, installation_type: &str) -> Self {
        self.installation_type = Some(installation_type.to_string());
        self
    }

    pub fn edition_id(mut self, edition_id: &str) -> Self {
        self.edition_id = Some(edition_id.to_string());
        self
    }

    pub fn default_language(mut self, language: &str) -> Self {
        self.default_language = Some(language.to_string());
        self
    }

    /// Set one of `MAJOR`, `MINOR`, `BUILD`, `SPBUILD`.
    pub fn version_part(mut self, part: &'static str, value: &str) -> Self {
        self.version.retain(|(name, _)| *name != part);
        self.version.push((part, value.to_string()));
        self
    }

    pub fn without_version_part(mut self, part: &str) -> Self {
        self.version.retain(|(name, _)| *name != part);
        self
    }

    pub fn to_xml(&self) -> String {
        let mut xml = match self.index {
            Some(index) => format!("<IMAGE INDEX=\"{index}\">"),
            None => "<IMAGE>".to_string(),
        };
        push(&mut xml, "NAME", &self.name);
        push(&mut xml, "DESCRIPTION", &self.description);
        push(&mut xml, "FLAGS", &self.flags);
        push(&mut xml, "TOTALBYTES", &self.total_bytes.map(|b| b.to_string()));
        push(&mut xml, "DISPLAYNAME", &self.display_name);
        push(&mut xml, "DISPLAYDESCRIPTION", &self.display_description);

        xml.push_str("<WINDOWS>");
        push(&mut xml, "ARCH", &self.arch);
        push(&mut xml, "PRODUCTTYPE", &self.product_type);
        push(&mut xml, "INSTALLATIONTYPE", &self.installation_type);
        push(&mut xml, "EDITIONID", &self.edition_id);
        if let Some(language) = &self.default_language {
            xml.push_str(&format!(
                "<LANGUAGES><LANGUAGE>{language}</LANGUAGE><DEFAULT>{language}</DEFAULT></LANGUAGES>"
            ));
        }
        if !self.version.is_empty() {
            xml.push_str("<VERSION>");
            for (part, value) in &self.version {
                xml.push_str(&format!("<{part}>{value}</{part}>"));
            }
            xml.push_str("</VERSION>");
        }
        xml.push_str("</WINDOWS>");

        xml.push_str("</IMAGE>");
        xml
    }
}

fn push(xml: &mut String, tag: &str, value: &Option<String>) {
    if let Some(value) = value {
        xml.push_str(&format!("<{tag}>{}</{tag}>", escape(value)));
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
