//! Archive progress messages and callback registration.
//!
//! The archive driver reports progress through a single process-wide entry
//! point. Callbacks are kept in a table keyed by the container handle they
//! were registered for, and backends forward every message to [`dispatch`].
//!
//! Callbacks run on whatever thread the driver reports from and must not
//! block. A callback must not register or dispatch for its own handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use vhdkit_shared::constants::wim::*;
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

use crate::native::RawHandle;

/// Message reported by the archive driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageMessage {
    Text(String),
    Progress { percent: u32, remaining_ms: u32 },
    /// A file is about to be processed. The only message that can abort.
    Process { path: PathBuf },
    Scanning { count: u32 },
    SetRange { count: u32 },
    SetPos { position: u32 },
    StepIt,
    Compress { path: PathBuf },
    Error { path: PathBuf, code: u32 },
    Alignment,
    Retry,
    Split,
    Unknown { id: u32 },
}

/// Message kind by raw driver id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Progress,
    Process,
    Scanning,
    SetRange,
    SetPos,
    StepIt,
    Compress,
    Error,
    Alignment,
    Retry,
    Split,
}

impl MessageKind {
    pub fn from_id(id: u32) -> Option<Self> {
        let kind = match id {
            WIM_MSG_TEXT => Self::Text,
            WIM_MSG_PROGRESS => Self::Progress,
            WIM_MSG_PROCESS => Self::Process,
            WIM_MSG_SCANNING => Self::Scanning,
            WIM_MSG_SETRANGE => Self::SetRange,
            WIM_MSG_SETPOS => Self::SetPos,
            WIM_MSG_STEPIT => Self::StepIt,
            WIM_MSG_COMPRESS => Self::Compress,
            WIM_MSG_ERROR => Self::Error,
            WIM_MSG_ALIGNMENT => Self::Alignment,
            WIM_MSG_RETRY => Self::Retry,
            WIM_MSG_SPLIT => Self::Split,
            _ => return None,
        };
        Some(kind)
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::Text => WIM_MSG_TEXT,
            Self::Progress => WIM_MSG_PROGRESS,
            Self::Process => WIM_MSG_PROCESS,
            Self::Scanning => WIM_MSG_SCANNING,
            Self::SetRange => WIM_MSG_SETRANGE,
            Self::SetPos => WIM_MSG_SETPOS,
            Self::StepIt => WIM_MSG_STEPIT,
            Self::Compress => WIM_MSG_COMPRESS,
            Self::Error => WIM_MSG_ERROR,
            Self::Alignment => WIM_MSG_ALIGNMENT,
            Self::Retry => WIM_MSG_RETRY,
            Self::Split => WIM_MSG_SPLIT,
        }
    }
}

impl ImageMessage {
    /// Raw driver id of this message.
    pub fn id(&self) -> u32 {
        match self {
            Self::Unknown { id } => *id,
            other => other.kind().map_or(WIM_MSG, |kind| kind.id()),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        let kind = match self {
            Self::Text(_) => MessageKind::Text,
            Self::Progress { .. } => MessageKind::Progress,
            Self::Process { .. } => MessageKind::Process,
            Self::Scanning { .. } => MessageKind::Scanning,
            Self::SetRange { .. } => MessageKind::SetRange,
            Self::SetPos { .. } => MessageKind::SetPos,
            Self::StepIt => MessageKind::StepIt,
            Self::Compress { .. } => MessageKind::Compress,
            Self::Error { .. } => MessageKind::Error,
            Self::Alignment => MessageKind::Alignment,
            Self::Retry => MessageKind::Retry,
            Self::Split => MessageKind::Split,
            Self::Unknown { .. } => return None,
        };
        Some(kind)
    }
}

/// Value a callback hands back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Success,
    Done,
    /// Skip the current file. Honored for `Process` messages only.
    Abort,
}

impl MessageStatus {
    pub fn as_raw(&self) -> u32 {
        match self {
            Self::Success => WIM_MSG_SUCCESS,
            Self::Done => WIM_MSG_DONE,
            Self::Abort => WIM_MSG_ABORT_IMAGE,
        }
    }
}

/// Callback invoked for every message of one container.
pub type MessageCallback = Box<dyn FnMut(&ImageMessage) -> MessageStatus + Send>;

type SharedCallback = Arc<Mutex<MessageCallback>>;

static CALLBACKS: Lazy<Mutex<HashMap<RawHandle, SharedCallback>>> = Lazy::new(Default::default);

/// Add `callback` to the table under `handle`.
pub(crate) fn register(handle: RawHandle, callback: MessageCallback) -> VhdkitResult<()> {
    let mut table = CALLBACKS.lock();
    if table.contains_key(&handle) {
        return Err(VhdkitError::InvalidState(format!(
            "a message callback is already registered for handle {handle}"
        )));
    }
    table.insert(handle, Arc::new(Mutex::new(callback)));
    tracing::debug!(handle = %handle, "Registered message callback");
    Ok(())
}

/// Remove the callback for `handle`. Returns whether one was present.
pub(crate) fn unregister(handle: RawHandle) -> bool {
    let removed = CALLBACKS.lock().remove(&handle).is_some();
    if removed {
        tracing::debug!(handle = %handle, "Unregistered message callback");
    }
    removed
}

pub fn is_registered(handle: RawHandle) -> bool {
    CALLBACKS.lock().contains_key(&handle)
}

/// Route one driver message to the callback registered for `handle`.
///
/// Messages for handles without a callback are acknowledged with
/// [`MessageStatus::Success`].
pub fn dispatch(handle: RawHandle, message: &ImageMessage) -> MessageStatus {
    let Some(callback) = CALLBACKS.lock().get(&handle).cloned() else {
        return MessageStatus::Success;
    };

    let status = {
        let mut guard = callback.lock();
        (*guard)(message)
    };

    match (status, message) {
        (MessageStatus::Abort, ImageMessage::Process { .. }) => MessageStatus::Abort,
        (MessageStatus::Abort, _) => {
            tracing::debug!(
                handle = %handle,
                message_id = message.id(),
                "Ignoring abort for a message that cannot be aborted"
            );
            MessageStatus::Success
        }
        (status, _) => status,
    }
}
