//! vhdkit - virtual disk creation and WIM archive introspection.
//!
//! Two independent surfaces share one native-handle model:
//!
//! - [`disk`] creates sparse or fixed VHD/VHDX files through a
//!   [`native::DiskBackend`].
//! - [`wim`] opens image archives through a [`native::ArchiveBackend`] and
//!   exposes their images with lazily parsed, cached metadata.
//!
//! Every backend handle is owned by a [`native::NativeHandle`] and released
//! exactly once, on `close` or drop. On Windows, `native::windows` provides
//! the `virtdisk.dll` and `wimgapi.dll` backends.

pub mod disk;
pub mod native;
pub mod options;
pub mod util;
pub mod wim;

pub use disk::{
    AllocationMode, CreateStatus, DiskCreationParameters, DiskCreationRequest, VirtualDisk,
    VirtualStorageDeviceType,
};
pub use native::{ArchiveBackend, DiskBackend, NativeHandle, RawHandle};
pub use options::VhdkitOptions;
pub use vhdkit_shared::errors::{VhdkitError, VhdkitResult};
pub use wim::{Architecture, Container, Image, ImageMessage, ImageVersion, MessageStatus};
