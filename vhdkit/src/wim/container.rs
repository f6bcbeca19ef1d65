//! Open WIM archive and the images it holds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::unsync::OnceCell;
use vhdkit_shared::constants::status::ERROR_INVALID_HANDLE;
use vhdkit_shared::constants::wim::{WIM_GENERIC_READ, WIM_OPEN_EXISTING, WIM_OPENED_EXISTING};
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use super::callback::{self, ImageMessage, MessageStatus};
use super::image::Image;
use super::metadata::{MetadataDocument, fetch_document};
use crate::native::{
    Acquisition, ArchiveBackend, ContainerKind, HandleKind, NativeHandle, RawHandle,
};
use crate::options::VhdkitOptions;

/// An archive opened read-only.
///
/// Owns every [`Image`] it enumerates and, optionally, one message callback.
/// Teardown (explicit [`close`](Self::close) or drop) runs in a fixed order:
/// images, then the callback, then the archive handle.
pub struct Container {
    path: PathBuf,
    handle: NativeHandle<ContainerKind>,
    images: OnceCell<Vec<Image>>,
    document: OnceCell<Option<MetadataDocument>>,
    callback_registered: bool,
}

impl Container {
    /// Open an existing archive with default options.
    pub fn open(backend: Arc<dyn ArchiveBackend>, path: impl AsRef<Path>) -> VhdkitResult<Self> {
        Self::open_with_options(backend, path, &VhdkitOptions::default())
    }

    pub fn open_with_options(
        backend: Arc<dyn ArchiveBackend>,
        path: impl AsRef<Path>,
        options: &VhdkitOptions,
    ) -> VhdkitResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(VhdkitError::argument("path", "archive path is empty"));
        }
        if !path.is_file() {
            return Err(VhdkitError::NotFound(path.to_path_buf()));
        }

        tracing::info!(path = %path.display(), "Opening archive");

        let handle = NativeHandle::<ContainerKind>::acquire(backend, |backend| {
            let opened = backend.create_file(path, WIM_GENERIC_READ, WIM_OPEN_EXISTING);
            let code = if opened.status != 0 {
                opened.status
            } else {
                ERROR_INVALID_HANDLE
            };
            if opened.creation_result != WIM_OPENED_EXISTING || opened.handle.is_null() {
                Acquisition::failed(
                    opened.handle,
                    VhdkitError::backend(ContainerKind::OPEN_OPERATION, code),
                )
            } else {
                Acquisition::ok(opened.handle)
            }
        })?;

        let raw = handle.require_raw()?;
        let temp_dir = options.resolve_temp_dir();
        if let Err(code) = handle.backend().set_temporary_path(raw, &temp_dir) {
            tracing::warn!(
                path = %path.display(),
                temp_dir = %temp_dir.display(),
                code,
                "Failed to set archive temporary path"
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            handle,
            images: OnceCell::new(),
            document: OnceCell::new(),
            callback_registered: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_handle(&self) -> Option<RawHandle> {
        self.handle.raw()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ArchiveBackend> {
        self.handle.backend()
    }

    /// Number of images, queried from the backend on every call.
    pub fn image_count(&self) -> VhdkitResult<u32> {
        let raw = self.handle.require_raw()?;
        Ok(self.backend().image_count(raw))
    }

    /// Every image in index order. Loaded on first call and cached.
    pub fn images(&self) -> VhdkitResult<&[Image]> {
        self.images
            .get_or_try_init(|| {
                let count = self.image_count()?;
                tracing::debug!(path = %self.path.display(), count, "Enumerating images");
                (1..=count).map(|index| Image::open(self, index)).collect()
            })
            .map(Vec::as_slice)
    }

    /// Image at a 1-based index.
    pub fn image_by_index(&self, index: u32) -> VhdkitResult<&Image> {
        let images = self.images()?;
        let count = u32::try_from(images.len()).unwrap_or(u32::MAX);
        index
            .checked_sub(1)
            .and_then(|i| images.get(i as usize))
            .ok_or(VhdkitError::IndexOutOfRange { index, count })
    }

    /// First image whose name or flags match `name`, ignoring case.
    pub fn image_by_name(&self, name: &str) -> VhdkitResult<Option<&Image>> {
        let wanted = name.to_uppercase();
        for image in self.images()? {
            if image.name()?.to_uppercase() == wanted || image.flags()?.to_uppercase() == wanted {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    /// Names of all images in index order.
    pub fn image_names(&self) -> VhdkitResult<Vec<String>> {
        self.images()?
            .iter()
            .map(|image| image.name().map(str::to_string))
            .collect()
    }

    /// Archive-level metadata document. Fetched at most once.
    pub fn metadata_document(&self) -> VhdkitResult<Option<&MetadataDocument>> {
        self.document
            .get_or_try_init(|| {
                let raw = self.handle.require_raw()?;
                fetch_document(&**self.backend(), raw)
            })
            .map(Option::as_ref)
    }

    /// Total size of the archive as recorded in its metadata.
    pub fn total_bytes(&self) -> VhdkitResult<u64> {
        let raw = self
            .metadata_document()?
            .and_then(|doc| doc.text("/WIM/TOTALBYTES"))
            .ok_or_else(|| VhdkitError::ParseFailure("metadata has no /WIM/TOTALBYTES".into()))?;
        raw.trim().parse().map_err(|e| {
            VhdkitError::ParseFailure(format!("/WIM/TOTALBYTES is not a number ({raw:?}): {e}"))
        })
    }

    // ========================================================================
    // MESSAGE CALLBACK
    // ========================================================================

    /// Receive driver messages for this archive.
    ///
    /// One callback per container; a second registration fails with
    /// `InvalidState` until [`unregister_callback`](Self::unregister_callback).
    pub fn register_callback<F>(&mut self, callback: F) -> VhdkitResult<()>
    where
        F: FnMut(&ImageMessage) -> MessageStatus + Send + 'static,
    {
        let raw = self.handle.require_raw()?;
        if self.callback_registered {
            return Err(VhdkitError::InvalidState(
                "a message callback is already registered for this archive".to_string(),
            ));
        }

        callback::register(raw, Box::new(callback))?;
        if let Err(code) = self.backend().register_message_callback(raw) {
            callback::unregister(raw);
            return Err(VhdkitError::backend("WIMRegisterMessageCallback", code));
        }

        self.callback_registered = true;
        Ok(())
    }

    /// Stop receiving messages. No-op when nothing is registered.
    pub fn unregister_callback(&mut self) -> VhdkitResult<()> {
        if !self.callback_registered {
            return Ok(());
        }
        self.callback_registered = false;

        let Some(raw) = self.handle.raw() else {
            return Ok(());
        };
        let result = self.backend().unregister_message_callback(raw);
        callback::unregister(raw);
        result.map_err(|code| VhdkitError::backend("WIMUnregisterMessageCallback", code))
    }

    pub fn has_callback(&self) -> bool {
        self.callback_registered
    }

    /// Close images, then the callback, then the archive.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned. Safe to call more than once.
    pub fn close(&mut self) -> VhdkitResult<()> {
        let mut first_error = None;

        if let Some(images) = self.images.get_mut() {
            for image in images.iter_mut() {
                if let Err(e) = image.close() {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.unregister_callback() {
            first_error.get_or_insert(e);
        }

        if self.handle.is_valid() {
            tracing::debug!(path = %self.path.display(), "Closing archive");
        }
        if let Err(e) = self.handle.close() {
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to close archive");
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .field("images_loaded", &self.images.get().map(Vec::len))
            .field("callback_registered", &self.callback_registered)
            .finish()
    }
}
