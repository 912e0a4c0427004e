//! Per-tree open-file state.

use std::time::SystemTime;

use crate::oplock::OplockType;
use crate::vfs::{ByteRange, DriverFileId};

/// One open file or directory handle, owned by its tree connection.
pub struct OpenFile {
    /// Handle the client uses; assigned by the tree on insert.
    pub fid: u16,
    /// Share-relative path the handle was opened on.
    pub path: String,
    /// Driver-side token for this open.
    pub driver_file: DriverFileId,
    /// NT access mask granted at open.
    pub access_mask: u32,
    /// NT share-access flags granted at open.
    pub share_access: u32,
    pub directory: bool,
    /// Client process the handle belongs to, for PROCESS_EXIT cleanup and
    /// lock ownership.
    pub pid: u16,
    /// Oplock held on [`Self::path`], if any. The oplock registry holds
    /// the authoritative state; this is the handle's view of it.
    pub oplock: Option<OplockType>,
    /// Delete the object when the handle closes.
    pub delete_on_close: bool,
    /// The driver completes the close asynchronously; the FID stays
    /// listed until then.
    pub delayed_close: bool,
    /// Writes performed through this handle.
    pub write_count: u32,
    pub opened_at: SystemTime,
    /// Byte-range locks granted through this handle.
    pub locks: Vec<ByteRange>,
}

impl OpenFile {
    pub fn new(
        path: String,
        driver_file: DriverFileId,
        access_mask: u32,
        share_access: u32,
        directory: bool,
    ) -> Self {
        Self {
            fid: 0,
            path,
            driver_file,
            access_mask,
            share_access,
            directory,
            pid: 0,
            oplock: None,
            delete_on_close: false,
            delayed_close: false,
            write_count: 0,
            opened_at: SystemTime::now(),
            locks: Vec::new(),
        }
    }

    pub fn record_write(&mut self) {
        self.write_count += 1;
    }
}
