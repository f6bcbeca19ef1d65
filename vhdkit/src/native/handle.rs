//! NativeHandle - scoped ownership of one backend handle
//!
//! A `NativeHandle<K>` owns exactly one raw handle produced by a backend and
//! releases it exactly once, either through an explicit [`NativeHandle::close`]
//! or when the wrapper is dropped. The kind parameter `K` selects which
//! backend trait the handle belongs to and which call releases it.
//!
//! ## State
//!
//! A handle is either *valid* (owns a resource) or *invalid* (never acquired,
//! or already released). The only transition is valid → invalid.
//!
//! ## Thread Safety
//!
//! No internal locking. `close` takes `&mut self`, so the borrow checker
//! already rules out closing a handle while another operation borrows it.

use std::marker::PhantomData;
use std::sync::Arc;

use vhdkit_shared::constants::status::ERROR_INVALID_HANDLE;
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use super::{ArchiveBackend, DiskBackend, RawHandle};

/// Resource kind owned by a [`NativeHandle`].
pub trait HandleKind: 'static {
    /// Short name used in logs.
    const NAME: &'static str;
    /// Backend call that produces this kind of handle.
    const OPEN_OPERATION: &'static str;
    /// Backend call that releases this kind of handle.
    const CLOSE_OPERATION: &'static str;

    type Backend: ?Sized + Send + Sync;

    fn release(backend: &Self::Backend, raw: RawHandle) -> Result<(), u32>;
}

/// Virtual disk handle.
#[derive(Debug)]
pub enum DiskKind {}

/// Open archive (WIM file) handle.
#[derive(Debug)]
pub enum ContainerKind {}

/// Image loaded from an open archive.
#[derive(Debug)]
pub enum ImageKind {}

impl HandleKind for DiskKind {
    const NAME: &'static str = "disk";
    const OPEN_OPERATION: &'static str = "CreateVirtualDisk";
    const CLOSE_OPERATION: &'static str = "CloseHandle";

    type Backend = dyn DiskBackend;

    fn release(backend: &Self::Backend, raw: RawHandle) -> Result<(), u32> {
        backend.close_handle(raw)
    }
}

impl HandleKind for ContainerKind {
    const NAME: &'static str = "container";
    const OPEN_OPERATION: &'static str = "WIMCreateFile";
    const CLOSE_OPERATION: &'static str = "WIMCloseHandle";

    type Backend = dyn ArchiveBackend;

    fn release(backend: &Self::Backend, raw: RawHandle) -> Result<(), u32> {
        backend.close_handle(raw)
    }
}

impl HandleKind for ImageKind {
    const NAME: &'static str = "image";
    const OPEN_OPERATION: &'static str = "WIMLoadImage";
    const CLOSE_OPERATION: &'static str = "WIMCloseHandle";

    type Backend = dyn ArchiveBackend;

    fn release(backend: &Self::Backend, raw: RawHandle) -> Result<(), u32> {
        backend.close_handle(raw)
    }
}

/// What a backend open/create call produced.
///
/// `raw` may be a real handle even when `status` is an error; acquisition
/// releases it before the error is returned.
#[derive(Debug)]
pub struct Acquisition {
    pub raw: RawHandle,
    pub status: VhdkitResult<()>,
}

impl Acquisition {
    pub fn ok(raw: RawHandle) -> Self {
        Self {
            raw,
            status: Ok(()),
        }
    }

    pub fn failed(raw: RawHandle, error: VhdkitError) -> Self {
        Self {
            raw,
            status: Err(error),
        }
    }
}

/// Owns one backend handle of kind `K`.
pub struct NativeHandle<K: HandleKind> {
    raw: Option<RawHandle>,
    backend: Arc<K::Backend>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind> NativeHandle<K> {
    /// Run a kind-specific backend open call and take ownership of its result.
    ///
    /// Never leaks: if the call returns a handle together with a failing
    /// status, the handle is released before the error is returned.
    pub fn acquire<F>(backend: Arc<K::Backend>, open: F) -> VhdkitResult<Self>
    where
        F: FnOnce(&K::Backend) -> Acquisition,
    {
        let handle = Self::acquire_optional(backend, open)?;
        if !handle.is_valid() {
            return Err(VhdkitError::backend(K::OPEN_OPERATION, ERROR_INVALID_HANDLE));
        }
        Ok(handle)
    }

    /// Like [`acquire`](Self::acquire), but a successful call that produced
    /// no handle yields an invalid wrapper instead of an error.
    pub fn acquire_optional<F>(backend: Arc<K::Backend>, open: F) -> VhdkitResult<Self>
    where
        F: FnOnce(&K::Backend) -> Acquisition,
    {
        let Acquisition { raw, status } = open(&*backend);
        let mut handle = Self::from_raw(backend, raw);

        if let Err(e) = status {
            if handle.is_valid() {
                tracing::debug!(
                    kind = K::NAME,
                    handle = %raw,
                    error = %e,
                    "Releasing partially acquired handle"
                );
            }
            if let Err(close_err) = handle.close() {
                tracing::warn!(kind = K::NAME, error = %close_err, "Failed to release handle after failed open");
            }
            return Err(e);
        }

        if handle.is_valid() {
            tracing::debug!(kind = K::NAME, handle = %raw, "Acquired native handle");
        }
        Ok(handle)
    }

    /// Wrap an already obtained raw value. Null sentinels produce an invalid
    /// handle that will never be released.
    pub fn from_raw(backend: Arc<K::Backend>, raw: RawHandle) -> Self {
        Self {
            raw: (!raw.is_null()).then_some(raw),
            backend,
            _kind: PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// Raw value while the handle is valid.
    pub fn raw(&self) -> Option<RawHandle> {
        self.raw
    }

    /// Raw value, or `InvalidState` once closed.
    pub fn require_raw(&self) -> VhdkitResult<RawHandle> {
        self.raw
            .ok_or_else(|| VhdkitError::InvalidState(format!("{} handle is closed", K::NAME)))
    }

    pub fn backend(&self) -> &Arc<K::Backend> {
        &self.backend
    }

    /// Release the handle. No-op once invalid.
    ///
    /// The handle is invalid afterwards even if the backend reports an error.
    pub fn close(&mut self) -> VhdkitResult<()> {
        let Some(raw) = self.raw.take() else {
            return Ok(());
        };

        tracing::debug!(kind = K::NAME, handle = %raw, "Releasing native handle");
        K::release(&self.backend, raw).map_err(|code| VhdkitError::backend(K::CLOSE_OPERATION, code))
    }
}

impl<K: HandleKind> Drop for NativeHandle<K> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(kind = K::NAME, error = %e, "Failed to release native handle");
        }
    }
}

impl<K: HandleKind> std::fmt::Debug for NativeHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &K::NAME)
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::SecurityDescriptor;
    use crate::native::{CreateVirtualDiskCall, CreateVirtualDiskOutcome};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingBackend {
        closed: Mutex<Vec<RawHandle>>,
        fail_close: bool,
    }

    impl DiskBackend for CountingBackend {
        fn initialize_security_descriptor(&self, _revision: u32) -> Option<SecurityDescriptor> {
            Some(SecurityDescriptor::default())
        }

        fn create_virtual_disk(&self, _call: &CreateVirtualDiskCall<'_>) -> CreateVirtualDiskOutcome {
            CreateVirtualDiskOutcome {
                status: 0,
                handle: RawHandle::new(1),
            }
        }

        fn close_handle(&self, handle: RawHandle) -> Result<(), u32> {
            self.closed.lock().push(handle);
            if self.fail_close { Err(ERROR_INVALID_HANDLE) } else { Ok(()) }
        }
    }

    fn backend() -> (Arc<CountingBackend>, Arc<dyn DiskBackend>) {
        let concrete = Arc::new(CountingBackend::default());
        let dynamic: Arc<dyn DiskBackend> = concrete.clone();
        (concrete, dynamic)
    }

    #[test]
    fn test_close_is_idempotent() {
        let (counting, backend) = backend();
        let mut handle = NativeHandle::<DiskKind>::from_raw(backend, RawHandle::new(7));
        assert!(handle.is_valid());

        handle.close().unwrap();
        handle.close().unwrap();
        drop(handle);

        assert_eq!(*counting.closed.lock(), vec![RawHandle::new(7)]);
    }

    #[test]
    fn test_drop_releases_once() {
        let (counting, backend) = backend();
        {
            let _handle = NativeHandle::<DiskKind>::from_raw(backend, RawHandle::new(9));
        }
        assert_eq!(*counting.closed.lock(), vec![RawHandle::new(9)]);
    }

    #[test]
    fn test_null_handle_is_never_released() {
        let (counting, backend) = backend();
        let handle = NativeHandle::<DiskKind>::from_raw(backend, RawHandle::NULL);
        assert!(handle.is_closed());
        drop(handle);
        assert!(counting.closed.lock().is_empty());
    }

    #[test]
    fn test_acquire_releases_handle_on_failed_status() {
        let (counting, backend) = backend();
        let result = NativeHandle::<DiskKind>::acquire(backend, |_| {
            Acquisition::failed(RawHandle::new(3), VhdkitError::backend("CreateVirtualDisk", 5))
        });

        assert!(matches!(result, Err(VhdkitError::Backend { code: 5, .. })));
        assert_eq!(*counting.closed.lock(), vec![RawHandle::new(3)]);
    }

    #[test]
    fn test_acquire_null_handle_is_backend_error() {
        let (counting, backend) = backend();
        let result = NativeHandle::<DiskKind>::acquire(backend, |_| Acquisition::ok(RawHandle::NULL));

        assert!(matches!(
            result,
            Err(VhdkitError::Backend {
                code: ERROR_INVALID_HANDLE,
                ..
            })
        ));
        assert!(counting.closed.lock().is_empty());
    }

    #[test]
    fn test_acquire_optional_accepts_null_handle() {
        let (counting, backend) = backend();
        let handle =
            NativeHandle::<DiskKind>::acquire_optional(backend, |_| Acquisition::ok(RawHandle::NULL))
                .unwrap();

        assert!(handle.is_closed());
        drop(handle);
        assert!(counting.closed.lock().is_empty());
    }

    #[test]
    fn test_failed_release_still_invalidates() {
        let counting = Arc::new(CountingBackend {
            fail_close: true,
            ..Default::default()
        });
        let backend: Arc<dyn DiskBackend> = counting.clone();
        let mut handle = NativeHandle::<DiskKind>::from_raw(backend, RawHandle::new(4));

        assert!(handle.close().is_err());
        assert!(handle.is_closed());
        assert!(handle.close().is_ok());
        assert_eq!(counting.closed.lock().len(), 1);
    }

    #[test]
    fn test_require_raw_after_close() {
        let (_counting, backend) = backend();
        let mut handle = NativeHandle::<DiskKind>::from_raw(backend, RawHandle::new(2));
        assert_eq!(handle.require_raw().unwrap(), RawHandle::new(2));
        handle.close().unwrap();
        assert!(matches!(handle.require_raw(), Err(VhdkitError::InvalidState(_))));
    }
}
