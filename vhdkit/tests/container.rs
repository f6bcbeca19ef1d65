//! Integration tests for opening archives and enumerating their images.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use vhdkit::wim::{Container, Image};
use vhdkit::{VhdkitError, VhdkitOptions};
use vhdkit_shared::constants::status::{ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND};
use vhdkit_shared::constants::wim::WIM_CREATED_NEW;
use vhdkit_test_utils::{ArchiveEvent, FakeArchiveBackend, ImageFixture, archive_file};

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct TestContext {
    backend: Arc<FakeArchiveBackend>,
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self::with_backend(FakeArchiveBackend::from_fixtures(&[
            ImageFixture::windows("Windows Server 2022 SERVERSTANDARDCORE", "ServerStandardCore"),
            ImageFixture::windows("Windows Server 2022 SERVERSTANDARD", "ServerStandard"),
            ImageFixture::windows("Windows Server 2022 SERVERDATACENTER", "ServerDatacenter"),
        ]))
    }

    fn with_backend(backend: FakeArchiveBackend) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = archive_file(&temp_dir, "install.wim");
        Self {
            backend: Arc::new(backend),
            path,
            _temp_dir: temp_dir,
        }
    }

    fn open(&self) -> Container {
        Container::open(self.backend.clone(), &self.path).expect("Failed to open archive")
    }
}

// ============================================================================
// OPEN
// ============================================================================

#[test]
fn empty_path_is_rejected() {
    let ctx = TestContext::new();
    let err = Container::open(ctx.backend.clone(), "").unwrap_err();
    assert!(matches!(err, VhdkitError::ArgumentInvalid { name: "path", .. }));
    assert!(ctx.backend.events().is_empty());
}

#[test]
fn missing_archive_is_not_found() {
    let ctx = TestContext::new();
    let missing = ctx.path.with_file_name("missing.wim");
    let err = Container::open(ctx.backend.clone(), &missing).unwrap_err();
    match err {
        VhdkitError::NotFound(path) => assert_eq!(path, missing),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn directory_is_not_an_archive() {
    let ctx = TestContext::new();
    let dir = ctx.path.with_file_name("install.wim.d");
    std::fs::create_dir(&dir).unwrap();

    let err = Container::open(ctx.backend.clone(), &dir).unwrap_err();
    match err {
        VhdkitError::NotFound(path) => assert_eq!(path, dir),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(ctx.backend.events().is_empty());
}

#[test]
fn open_sets_temporary_path_from_options() {
    let ctx = TestContext::new();
    let scratch = ctx.path.with_file_name("scratch");
    let options = VhdkitOptions {
        temp_dir: Some(scratch.clone()),
        ..Default::default()
    };

    let container = Container::open_with_options(ctx.backend.clone(), &ctx.path, &options).unwrap();
    let raw = container.raw_handle().unwrap();

    assert_eq!(
        ctx.backend.events(),
        vec![ArchiveEvent::Opened(raw), ArchiveEvent::TempPath(raw, scratch)]
    );
    assert_eq!(container.path(), ctx.path);
}

#[test]
fn temporary_path_failure_is_not_fatal() {
    let ctx = TestContext::with_backend(
        FakeArchiveBackend::from_fixtures(&[]).with_temp_path_error(ERROR_ACCESS_DENIED),
    );
    let container = ctx.open();
    assert!(!container.is_closed());
}

#[test]
fn unexpected_creation_result_releases_handle() {
    let ctx = TestContext::with_backend(
        FakeArchiveBackend::from_fixtures(&[])
            .with_creation_result(WIM_CREATED_NEW, ERROR_ACCESS_DENIED),
    );
    let err = Container::open(ctx.backend.clone(), &ctx.path).unwrap_err();

    assert_eq!(err.code(), Some(ERROR_ACCESS_DENIED));
    assert_eq!(ctx.backend.closed().len(), 1);
    assert_eq!(ctx.backend.open_handles(), 0);
}

#[test]
fn null_open_reports_driver_error() {
    let ctx = TestContext::with_backend(
        FakeArchiveBackend::from_fixtures(&[]).with_null_open(ERROR_FILE_NOT_FOUND),
    );
    let err = Container::open(ctx.backend.clone(), &ctx.path).unwrap_err();

    assert_eq!(err.code(), Some(ERROR_FILE_NOT_FOUND));
    assert!(ctx.backend.closed().is_empty());
}

// ============================================================================
// ENUMERATION
// ============================================================================

#[test]
fn images_are_loaded_once_in_order() {
    let ctx = TestContext::new();
    let container = ctx.open();

    let first = container.images().unwrap();
    let second = container.images().unwrap();

    assert_eq!(first.len(), 3);
    assert!(std::ptr::eq(first.as_ptr(), second.as_ptr()));
    assert_eq!(ctx.backend.load_calls(), 3);
    let indexes: Vec<u32> = first.iter().map(Image::index).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
}

#[test]
fn image_count_is_queried_fresh() {
    let ctx = TestContext::new();
    let container = ctx.open();
    assert_eq!(container.image_count().unwrap(), 3);
    assert_eq!(container.image_count().unwrap(), 3);
    assert_eq!(ctx.backend.load_calls(), 0);
}

#[test]
fn images_keep_their_snapshot_when_count_changes() {
    let ctx = TestContext::new();
    let container = ctx.open();
    assert_eq!(container.images().unwrap().len(), 3);

    ctx.backend.set_image_count(5);

    assert_eq!(container.image_count().unwrap(), 5);
    assert_eq!(container.images().unwrap().len(), 3);
    assert_eq!(ctx.backend.load_calls(), 3);
    assert!(matches!(
        container.image_by_index(4),
        Err(VhdkitError::IndexOutOfRange { index: 4, count: 3 })
    ));
}

#[test]
fn image_by_index_is_one_based() {
    let ctx = TestContext::new();
    let container = ctx.open();

    for index in 1..=3 {
        let image = container.image_by_index(index).unwrap();
        assert_eq!(image.index(), index);
        assert_eq!(image.metadata().unwrap().index().unwrap(), index);
    }

    for index in [0, 4] {
        let err = container.image_by_index(index).unwrap_err();
        assert!(matches!(err, VhdkitError::IndexOutOfRange { count: 3, .. }));
    }
}

#[test]
fn image_by_name_matches_name_or_flags_ignoring_case() {
    let ctx = TestContext::new();
    let container = ctx.open();

    let by_name = container
        .image_by_name("windows server 2022 serverstandard")
        .unwrap()
        .unwrap();
    assert_eq!(by_name.index(), 2);

    let by_flags = container.image_by_name("SERVERDATACENTER").unwrap().unwrap();
    assert_eq!(by_flags.index(), 3);

    assert!(container.image_by_name("ServerWeb").unwrap().is_none());
}

#[test]
fn image_names_in_order() {
    let ctx = TestContext::new();
    let container = ctx.open();
    assert_eq!(
        container.image_names().unwrap(),
        vec![
            "Windows Server 2022 SERVERSTANDARDCORE",
            "Windows Server 2022 SERVERSTANDARD",
            "Windows Server 2022 SERVERDATACENTER",
        ]
    );
}

#[test]
fn load_failure_is_backend_error() {
    let ctx = TestContext::with_backend(
        FakeArchiveBackend::from_fixtures(&[ImageFixture::windows("A", "A")])
            .with_load_error(ERROR_ACCESS_DENIED),
    );
    let container = ctx.open();
    let err = container.images().unwrap_err();
    assert_eq!(err.code(), Some(ERROR_ACCESS_DENIED));
}

#[test]
fn standalone_image_checks_bounds() {
    let ctx = TestContext::new();
    let container = ctx.open();

    assert!(matches!(
        Image::open(&container, 0),
        Err(VhdkitError::IndexOutOfRange { index: 0, count: 3 })
    ));
    assert!(matches!(
        Image::open(&container, 4),
        Err(VhdkitError::IndexOutOfRange { index: 4, count: 3 })
    ));

    let mut image = Image::open(&container, 2).unwrap();
    assert_eq!(image.name().unwrap(), "Windows Server 2022 SERVERSTANDARD");
    assert_eq!(image.container_handle(), container.raw_handle().unwrap());
    image.close().unwrap();
    assert!(image.is_closed());
}

// ============================================================================
// CONTAINER METADATA
// ============================================================================

#[test]
fn container_document_is_fetched_once() {
    let ctx = TestContext::new();
    let container = ctx.open();
    let raw = container.raw_handle().unwrap();

    let doc = container.metadata_document().unwrap().unwrap();
    assert_eq!(doc.root().name(), "WIM");
    container.metadata_document().unwrap();
    assert_eq!(container.total_bytes().unwrap(), 3 * 8_589_934_592);

    assert_eq!(ctx.backend.info_fetches(raw), 1);
}

#[test]
fn absent_container_document_is_cached() {
    let ctx = TestContext::with_backend(FakeArchiveBackend::new(None, Vec::new()));
    let container = ctx.open();
    let raw = container.raw_handle().unwrap();

    assert!(container.metadata_document().unwrap().is_none());
    assert!(container.metadata_document().unwrap().is_none());
    assert_eq!(ctx.backend.info_fetches(raw), 1);
    assert!(matches!(container.total_bytes(), Err(VhdkitError::ParseFailure(_))));
}

#[test]
fn malformed_container_document_is_parse_failure() {
    let ctx = TestContext::with_backend(FakeArchiveBackend::new(
        Some("<WIM><TOTALBYTES>1</WIM>".to_string()),
        Vec::new(),
    ));
    let container = ctx.open();
    assert!(matches!(
        container.metadata_document(),
        Err(VhdkitError::ParseFailure(_))
    ));
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[test]
fn close_releases_images_before_archive() {
    let ctx = TestContext::new();
    let mut container = ctx.open();
    let raw = container.raw_handle().unwrap();
    let image_handles: Vec<_> = container
        .images()
        .unwrap()
        .iter()
        .map(|image| image.raw_handle().unwrap())
        .collect();

    container.close().unwrap();

    let mut expected = image_handles;
    expected.push(raw);
    assert_eq!(ctx.backend.closed(), expected);
    assert!(container.is_closed());
}

#[test]
fn close_is_idempotent() {
    let ctx = TestContext::new();
    let mut container = ctx.open();
    container.images().unwrap();

    container.close().unwrap();
    container.close().unwrap();
    drop(container);

    assert_eq!(ctx.backend.closed().len(), 4);
    assert_eq!(ctx.backend.open_handles(), 0);
}

#[test]
fn drop_releases_everything() {
    let ctx = TestContext::new();
    {
        let container = ctx.open();
        container.image_by_index(1).unwrap();
    }
    assert_eq!(ctx.backend.open_handles(), 0);
}

#[test]
fn closed_archive_rejects_operations() {
    let ctx = TestContext::new();
    let mut container = ctx.open();
    container.close().unwrap();

    assert!(matches!(container.image_count(), Err(VhdkitError::InvalidState(_))));
    assert!(matches!(container.images(), Err(VhdkitError::InvalidState(_))));
    assert!(matches!(
        Image::open(&container, 1),
        Err(VhdkitError::InvalidState(_))
    ));
}
