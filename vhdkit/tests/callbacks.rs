//! Integration tests for archive message callbacks.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use vhdkit::VhdkitError;
use vhdkit::wim::{Container, ImageMessage, MessageStatus, is_registered};
use vhdkit_shared::constants::status::ERROR_ACCESS_DENIED;
use vhdkit_test_utils::{ArchiveEvent, FakeArchiveBackend, ImageFixture, archive_file};

struct TestContext {
    backend: Arc<FakeArchiveBackend>,
    container: Container,
    _temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self::with_backend(FakeArchiveBackend::from_fixtures(&[
            ImageFixture::windows("Windows Server 2022 SERVERSTANDARD", "ServerStandard"),
        ]))
    }

    fn with_backend(backend: FakeArchiveBackend) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = archive_file(&temp_dir, "install.wim");
        let backend = Arc::new(backend);
        let container = Container::open(backend.clone(), &path).expect("Failed to open archive");
        Self {
            backend,
            container,
            _temp_dir: temp_dir,
        }
    }

    fn raw(&self) -> vhdkit::RawHandle {
        self.container.raw_handle().unwrap()
    }
}

fn process(path: &str) -> ImageMessage {
    ImageMessage::Process {
        path: PathBuf::from(path),
    }
}

#[test]
fn registered_callback_receives_messages() {
    let mut ctx = TestContext::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.container
        .register_callback(move |message| {
            sink.lock().push(message.clone());
            MessageStatus::Success
        })
        .unwrap();

    let raw = ctx.raw();
    assert!(ctx.container.has_callback());
    assert!(is_registered(raw));

    let progress = ImageMessage::Progress {
        percent: 40,
        remaining_ms: 1200,
    };
    assert_eq!(ctx.backend.send(raw, &progress), MessageStatus::Success);
    assert_eq!(
        ctx.backend.send(raw, &process("Windows\\System32\\ntdll.dll")),
        MessageStatus::Success
    );

    assert_eq!(
        *seen.lock(),
        vec![progress, process("Windows\\System32\\ntdll.dll")]
    );
}

#[test]
fn abort_is_honored_only_for_process_messages() {
    let mut ctx = TestContext::new();
    ctx.container
        .register_callback(|_| MessageStatus::Abort)
        .unwrap();
    let raw = ctx.raw();

    assert_eq!(
        ctx.backend.send(raw, &process("pagefile.sys")),
        MessageStatus::Abort
    );
    assert_eq!(
        ctx.backend.send(raw, &ImageMessage::Text("copying".to_string())),
        MessageStatus::Success
    );
    assert_eq!(
        ctx.backend.send(raw, &ImageMessage::Scanning { count: 10 }),
        MessageStatus::Success
    );
}

#[test]
fn second_registration_is_invalid_state() {
    let mut ctx = TestContext::new();
    ctx.container
        .register_callback(|_| MessageStatus::Success)
        .unwrap();

    let err = ctx
        .container
        .register_callback(|_| MessageStatus::Abort)
        .unwrap_err();
    assert!(matches!(err, VhdkitError::InvalidState(_)));

    // The first callback stays in place.
    let raw = ctx.raw();
    assert_eq!(
        ctx.backend.send(raw, &process("a.txt")),
        MessageStatus::Success
    );
}

#[test]
fn unregister_then_register_again() {
    let mut ctx = TestContext::new();
    let raw = ctx.raw();

    ctx.container
        .register_callback(|_| MessageStatus::Abort)
        .unwrap();
    ctx.container.unregister_callback().unwrap();
    assert!(!ctx.container.has_callback());
    assert!(!is_registered(raw));
    assert_eq!(
        ctx.backend.send(raw, &process("a.txt")),
        MessageStatus::Success
    );

    ctx.container
        .register_callback(|_| MessageStatus::Abort)
        .unwrap();
    assert_eq!(
        ctx.backend.send(raw, &process("a.txt")),
        MessageStatus::Abort
    );
}

#[test]
fn unregister_without_callback_is_noop() {
    let mut ctx = TestContext::new();
    ctx.container.unregister_callback().unwrap();
    assert!(
        !ctx.backend
            .events()
            .iter()
            .any(|event| matches!(event, ArchiveEvent::CallbackUnregistered(_)))
    );
}

#[test]
fn backend_registration_failure_leaves_nothing_registered() {
    let mut ctx = TestContext::with_backend(
        FakeArchiveBackend::from_fixtures(&[]).with_register_error(ERROR_ACCESS_DENIED),
    );
    let raw = ctx.raw();

    let err = ctx
        .container
        .register_callback(|_| MessageStatus::Success)
        .unwrap_err();

    assert_eq!(err.code(), Some(ERROR_ACCESS_DENIED));
    assert!(!ctx.container.has_callback());
    assert!(!is_registered(raw));
}

#[test]
fn close_unregisters_after_images_and_before_archive() {
    let mut ctx = TestContext::new();
    let raw = ctx.raw();
    let image = ctx.container.image_by_index(1).unwrap().raw_handle().unwrap();
    ctx.container
        .register_callback(|_| MessageStatus::Success)
        .unwrap();

    ctx.container.close().unwrap();

    let teardown: Vec<ArchiveEvent> = ctx
        .backend
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                ArchiveEvent::Closed(_) | ArchiveEvent::CallbackUnregistered(_)
            )
        })
        .collect();
    assert_eq!(
        teardown,
        vec![
            ArchiveEvent::Closed(image),
            ArchiveEvent::CallbackUnregistered(raw),
            ArchiveEvent::Closed(raw),
        ]
    );
    assert!(!is_registered(raw));
}

#[test]
fn closed_archive_cannot_register() {
    let mut ctx = TestContext::new();
    ctx.container.close().unwrap();
    let err = ctx
        .container
        .register_callback(|_| MessageStatus::Success)
        .unwrap_err();
    assert!(matches!(err, VhdkitError::InvalidState(_)));
}
