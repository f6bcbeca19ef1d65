//! One image loaded from an open archive.

use once_cell::unsync::OnceCell;
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use super::container::Container;
use super::info::{Architecture, ImageMetadata, ImageVersion};
use super::metadata::{MetadataDocument, fetch_document};
use crate::native::{Acquisition, HandleKind, ImageKind, NativeHandle, RawHandle};

/// Image inside a [`Container`], addressed by 1-based index.
///
/// Metadata is fetched and parsed on first access and cached for the
/// lifetime of the image, including the "no metadata" case.
#[derive(Debug)]
pub struct Image {
    container: RawHandle,
    index: u32,
    handle: NativeHandle<ImageKind>,
    document: OnceCell<Option<MetadataDocument>>,
}

impl Image {
    /// Load image `index` (1-based) from an open container.
    ///
    /// The returned image is owned by the caller, not by `container`. Close
    /// or drop it before closing `container`; the archive handle it was
    /// loaded from is not kept alive on its behalf.
    pub fn open(container: &Container, index: u32) -> VhdkitResult<Self> {
        let container_raw = container.raw_handle().ok_or_else(|| {
            VhdkitError::InvalidState(
                "the archive has already been closed or is invalid".to_string(),
            )
        })?;

        let count = container.image_count()?;
        if index == 0 || index > count {
            return Err(VhdkitError::IndexOutOfRange { index, count });
        }

        let handle = NativeHandle::<ImageKind>::acquire(container.backend().clone(), |backend| {
            match backend.load_image(container_raw, index) {
                Ok(raw) => Acquisition::ok(raw),
                Err(code) => Acquisition::failed(
                    RawHandle::NULL,
                    VhdkitError::backend(ImageKind::OPEN_OPERATION, code),
                ),
            }
        })?;

        tracing::debug!(
            container = %container_raw,
            index,
            handle = ?handle.raw(),
            "Loaded image"
        );

        Ok(Self {
            container: container_raw,
            index,
            handle,
            document: OnceCell::new(),
        })
    }

    /// 1-based index this image was loaded with.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Raw handle of the owning container. Not owned by the image.
    pub fn container_handle(&self) -> RawHandle {
        self.container
    }

    pub fn raw_handle(&self) -> Option<RawHandle> {
        self.handle.raw()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Parsed metadata document, `None` when the archive has none for this
    /// image. Fetched at most once.
    pub fn metadata_document(&self) -> VhdkitResult<Option<&MetadataDocument>> {
        self.document
            .get_or_try_init(|| {
                let raw = self.handle.require_raw()?;
                fetch_document(&**self.handle.backend(), raw)
            })
            .map(Option::as_ref)
    }

    pub fn metadata(&self) -> VhdkitResult<ImageMetadata<'_>> {
        Ok(ImageMetadata::new(self.metadata_document()?))
    }

    pub fn name(&self) -> VhdkitResult<&str> {
        self.metadata()?.name()
    }

    pub fn edition_id(&self) -> VhdkitResult<&str> {
        self.metadata()?.edition_id()
    }

    pub fn flags(&self) -> VhdkitResult<String> {
        Ok(self.metadata()?.flags())
    }

    pub fn product_type(&self) -> VhdkitResult<&str> {
        self.metadata()?.product_type()
    }

    pub fn installation_type(&self) -> VhdkitResult<&str> {
        self.metadata()?.installation_type()
    }

    pub fn description(&self) -> VhdkitResult<&str> {
        self.metadata()?.description()
    }

    pub fn total_bytes(&self) -> VhdkitResult<u64> {
        self.metadata()?.total_bytes()
    }

    pub fn architecture(&self) -> VhdkitResult<Architecture> {
        Ok(self.metadata()?.architecture())
    }

    pub fn default_language(&self) -> VhdkitResult<Option<&str>> {
        Ok(self.metadata()?.default_language())
    }

    pub fn version(&self) -> VhdkitResult<ImageVersion> {
        Ok(self.metadata()?.version())
    }

    pub fn display_name(&self) -> VhdkitResult<&str> {
        self.metadata()?.display_name()
    }

    pub fn display_description(&self) -> VhdkitResult<&str> {
        self.metadata()?.display_description()
    }

    /// Release the image handle. Safe to call more than once.
    pub fn close(&mut self) -> VhdkitResult<()> {
        self.handle.close()
    }
}
