//! Backend constants
//!
//! These values are part of the native ABI and must match what the disk and
//! archive drivers expect on the other side of the backend boundary.

/// Status codes returned by backend calls.
pub mod status {
    pub const ERROR_SUCCESS: u32 = 0x0000_0000;
    pub const ERROR_FILE_NOT_FOUND: u32 = 0x0000_0002;
    pub const ERROR_ACCESS_DENIED: u32 = 0x0000_0005;
    pub const ERROR_INVALID_HANDLE: u32 = 0x0000_0006;
    pub const ERROR_BAD_COMMAND: u32 = 0x0000_0016;
    pub const ERROR_DEV_NOT_EXIST: u32 = 0x0000_0037;
    pub const ERROR_INSUFFICIENT_BUFFER: u32 = 0x0000_007A;
    pub const ERROR_IO_PENDING: u32 = 0x0000_03E5;
    pub const ERROR_NOT_FOUND: u32 = 0x0000_0490;
    pub const ERROR_VIRTDISK_NOT_VIRTUAL_DISK: u32 = 0xC03A_0015;

    /// Whether a create call was accepted (completed or queued).
    pub fn is_accepted(code: u32) -> bool {
        code == ERROR_SUCCESS || code == ERROR_IO_PENDING
    }
}

/// Virtual disk geometry and chain defaults
pub mod disk {
    /// Sector size accepted by every supported backend.
    pub const DISK_SECTOR_SIZE: u32 = 0x0000_0200;

    /// Block size used for sparse VHD (v1) disks when none is given.
    pub const DEFAULT_BLOCK_SIZE: u32 = 0x0008_0000;

    /// Depth searched in a differencing chain when opening read/write.
    pub const OPEN_VIRTUAL_DISK_RW_DEFAULT_DEPTH: u32 = 0x0000_0001;

    /// Revision passed when initializing a security descriptor.
    pub const SECURITY_DESCRIPTOR_REVISION: u32 = 1;
}

/// Archive (WIM) driver constants
pub mod wim {
    pub const WM_APP: u32 = 0x0000_8000;

    /// Base id of archive progress messages.
    pub const WIM_MSG: u32 = WM_APP + 0x1476;
    pub const WIM_MSG_TEXT: u32 = WIM_MSG + 1;
    pub const WIM_MSG_PROGRESS: u32 = WIM_MSG + 2;
    pub const WIM_MSG_PROCESS: u32 = WIM_MSG + 3;
    pub const WIM_MSG_SCANNING: u32 = WIM_MSG + 4;
    pub const WIM_MSG_SETRANGE: u32 = WIM_MSG + 5;
    pub const WIM_MSG_SETPOS: u32 = WIM_MSG + 6;
    pub const WIM_MSG_STEPIT: u32 = WIM_MSG + 7;
    pub const WIM_MSG_COMPRESS: u32 = WIM_MSG + 8;
    pub const WIM_MSG_ERROR: u32 = WIM_MSG + 9;
    pub const WIM_MSG_ALIGNMENT: u32 = WIM_MSG + 10;
    pub const WIM_MSG_RETRY: u32 = WIM_MSG + 11;
    pub const WIM_MSG_SPLIT: u32 = WIM_MSG + 12;

    /// Callback return values.
    pub const WIM_MSG_SUCCESS: u32 = 0x0000_0000;
    pub const WIM_MSG_DONE: u32 = 0xFFFF_FFF0;
    pub const WIM_MSG_ABORT_IMAGE: u32 = 0xFFFF_FFFF;

    pub const WIM_GENERIC_READ: u32 = 0x8000_0000;
    pub const WIM_OPEN_EXISTING: u32 = 0x0000_0003;

    /// Creation results reported by the create-file call.
    pub const WIM_CREATED_NEW: u32 = 0x0000_0000;
    pub const WIM_OPENED_EXISTING: u32 = 0x0000_0001;

    pub const WIM_FLAG_VERIFY: u32 = 0x0000_0002;
    pub const WIM_FLAG_INDEX: u32 = 0x0000_0004;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids() {
        assert_eq!(wim::WIM_MSG, 0x9476);
        assert_eq!(wim::WIM_MSG_PROCESS, 0x9479);
        assert_eq!(wim::WIM_MSG_SPLIT, 0x9482);
    }

    #[test]
    fn test_accepted_statuses() {
        assert!(status::is_accepted(status::ERROR_SUCCESS));
        assert!(status::is_accepted(status::ERROR_IO_PENDING));
        assert!(!status::is_accepted(status::ERROR_NOT_FOUND));
    }
}
