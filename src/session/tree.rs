//! Shared devices and tree connections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::notify::NotifyRegistry;
use crate::oplock::OplockRegistry;
use crate::session::file::OpenFile;
use crate::smb1::{access, share_access};
use crate::vfs::{DiskInterface, ShareStatus};

/// Maximum open files per tree connection.
pub const MAX_OPEN_FILES: usize = 2048;

/// Kind of a shared device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceType {
    Disk,
    /// `IPC$`: the admin named-pipe share. Pipe I/O itself belongs to the
    /// out-of-scope DCE-RPC collaborator.
    AdminPipe,
}

impl DeviceType {
    /// Service string announced in tree-connect responses.
    pub fn service_name(self) -> &'static str {
        match self {
            DeviceType::Disk => "A:",
            DeviceType::AdminPipe => "IPC",
        }
    }
}

/// One exported share: the driver plus the cross-session state scoped to
/// it (oplock table, change-notification registry).
pub struct SharedDevice {
    pub name: String,
    pub device: DeviceType,
    driver: Option<Arc<dyn DiskInterface>>,
    pub notify: Arc<NotifyRegistry>,
    pub oplocks: Arc<OplockRegistry>,
}

impl SharedDevice {
    pub fn new_disk(name: &str, driver: Arc<dyn DiskInterface>, config: &ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            device: DeviceType::Disk,
            driver: Some(driver),
            notify: Arc::new(NotifyRegistry::new(config.notify_buffer_limit)),
            oplocks: Arc::new(OplockRegistry::new(config.oplock_break_timeout)),
        }
    }

    pub fn new_admin_pipe(config: &ServerConfig) -> Self {
        Self {
            name: "IPC$".to_string(),
            device: DeviceType::AdminPipe,
            driver: None,
            notify: Arc::new(NotifyRegistry::new(config.notify_buffer_limit)),
            oplocks: Arc::new(OplockRegistry::new(config.oplock_break_timeout)),
        }
    }

    /// The filesystem driver, absent on pipe devices.
    pub fn disk(&self) -> Option<&Arc<dyn DiskInterface>> {
        self.driver.as_ref()
    }
}

/// The shares this server exports. Built once at startup; lookups are
/// case-insensitive as share names on the wire are.
pub struct ShareList {
    shares: Vec<Arc<SharedDevice>>,
}

impl ShareList {
    pub fn new(config: &ServerConfig) -> Self {
        Self { shares: vec![Arc::new(SharedDevice::new_admin_pipe(config))] }
    }

    pub fn add(&mut self, share: SharedDevice) {
        self.shares.push(Arc::new(share));
    }

    pub fn find(&self, name: &str) -> Option<Arc<SharedDevice>> {
        self.shares.iter().find(|s| s.name.eq_ignore_ascii_case(name)).cloned()
    }
}

/// A share bound to a virtual circuit.
pub struct TreeConnection {
    pub tid: u16,
    pub share: Arc<SharedDevice>,
    /// Authorization standing on the share. Immutable after bind.
    permission: ShareStatus,
    files: HashMap<u16, OpenFile>,
    next_fid: u16,
}

impl TreeConnection {
    pub fn new(tid: u16, share: Arc<SharedDevice>, permission: ShareStatus) -> Self {
        Self { tid, share, permission, files: HashMap::new(), next_fid: 1 }
    }

    pub fn permission(&self) -> ShareStatus {
        self.permission
    }

    pub fn has_read_permission(&self) -> bool {
        !matches!(self.permission, ShareStatus::NoAccess)
    }

    pub fn has_write_permission(&self) -> bool {
        matches!(self.permission, ShareStatus::Writeable)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.permission, ShareStatus::ReadOnly)
    }

    /// Inserts an open file, assigning its FID. FIDs rotate through a
    /// 16-bit counter, skipping zero and live handles.
    pub fn add_file(&mut self, mut file: OpenFile) -> Option<u16> {
        if self.files.len() >= MAX_OPEN_FILES {
            return None;
        }
        loop {
            let fid = self.next_fid;
            self.next_fid = self.next_fid.wrapping_add(1);
            if fid == 0 || self.files.contains_key(&fid) {
                continue;
            }
            file.fid = fid;
            self.files.insert(fid, file);
            return Some(fid);
        }
    }

    pub fn find_file(&self, fid: u16) -> Option<&OpenFile> {
        self.files.get(&fid)
    }

    pub fn find_file_mut(&mut self, fid: u16) -> Option<&mut OpenFile> {
        self.files.get_mut(&fid)
    }

    /// Removes the handle from the table. Delayed-close handles are left
    /// in place by the close path and removed by its completion.
    pub fn take_file(&mut self, fid: u16) -> Option<OpenFile> {
        self.files.remove(&fid)
    }

    /// Re-inserts a handle under its existing FID, used to retain a
    /// delayed-close handle until the driver completes.
    pub fn restore_file(&mut self, file: OpenFile) {
        self.files.insert(file.fid, file);
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn fids(&self) -> Vec<u16> {
        self.files.keys().copied().collect()
    }

    /// Open handles on a path, used for oplock grant eligibility and
    /// share-mode checks.
    pub fn opens_on_path(&self, path: &str) -> usize {
        self.files.values().filter(|f| f.path.eq_ignore_ascii_case(path)).count()
    }

    /// `true` when an existing open on `path` excludes a new open
    /// requesting `access_mask` under the share-access rules the drivers
    /// enforce: deny-all share flags exclude everything, and a missing
    /// write bit excludes write access.
    pub fn sharing_denies(&self, path: &str, access_mask: u32) -> bool {
        let wants_write =
            access_mask & (access::WRITE_DATA | access::GENERIC_WRITE) != 0;
        self.files.values().filter(|f| f.path.eq_ignore_ascii_case(path)).any(|f| {
            f.share_access == share_access::NONE
                || (wants_write && f.share_access & share_access::WRITE == 0)
        })
    }
}
