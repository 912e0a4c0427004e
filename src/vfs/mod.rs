//! Defines the filesystem driver interface --- [`DiskInterface`] --- and the
//! other interfaces the engine consumes (authenticator, capability traits).
//!
//! The engine never touches a disk itself: every filesystem effect goes
//! through a [`DiskInterface`] implementation bound to a share. Optional
//! behaviors (streams, byte-range locks, ioctl, security descriptors,
//! dynamic sizing) are separate traits discovered by capability probing.

pub mod file;
pub mod search;

use async_trait::async_trait;

use crate::vfs::file::{DiskInfo, FileInfo, NtTime, StreamInfo, VolumeInfo};
use crate::vfs::search::SearchCursor;

/// Result of [`DiskInterface`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of share-relative paths passed into [`DiskInterface`].
pub const MAX_PATH_LEN: usize = 1024;

/// [`DiskInterface`] errors.
///
/// Drivers signal failures as these typed variants; the dispatcher maps
/// each variant to a wire status at a single translation boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The file or directory name specified does not exist.
    NotFound,
    /// An intermediate component of the path does not exist.
    PathNotFound,
    /// The caller does not have the correct permission to perform the
    /// requested operation.
    AccessDenied,
    /// The object is already open with share-access flags that exclude
    /// this open.
    Sharing,
    /// The object specified already exists.
    FileExists,
    /// An attempt was made to remove a directory that was not empty.
    DirNotEmpty,
    /// The operation would have exceeded the filesystem's capacity.
    DiskFull,
    /// The backing filesystem is not currently available.
    Offline,
    /// The path addresses a pseudo file materialized on open; the
    /// operation is meaningless until then.
    Pseudo,
    /// The driver cannot open any more files.
    TooManyFiles,
    /// The path contains characters or components the filesystem rejects.
    BadName,
    /// A byte-range lock conflicts with one already held.
    LockConflict,
    /// An unlock addressed a range that is not locked.
    NotLocked,
    /// The driver does not implement the requested operation.
    NotSupported,
    /// An argument was malformed or out of range.
    InvalidParameter,
    /// The object is a directory and the operation needs a file.
    IsDirectory,
    /// The object is a file and the operation needs a directory.
    NotDirectory,
    /// An error occurred inside the driver that maps to no other variant.
    General,
}

/// Existence check result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileStatus {
    NotExist,
    File,
    Directory,
}

/// Opaque driver-assigned token for an open file.
///
/// The driver keys its own open-file state with it; the engine stores it
/// inside the [`crate::session::file::OpenFile`] it belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DriverFileId(pub u64);

/// Parameters of an open or create operation, decoded from whichever
/// command variant carried them.
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// Share-relative path, `\`-separated, leading `\` included.
    pub path: String,
    /// NT desired-access mask.
    pub access_mask: u32,
    /// NT share-access bits.
    pub share_access: u32,
    /// NT extended attributes to apply on create.
    pub attributes: u32,
    /// Allocation size hint, zero when the client sent none.
    pub allocation_size: u64,
    /// The open must produce (or target) a directory.
    pub directory: bool,
    /// Truncate an existing file to zero on open.
    pub overwrite: bool,
}

impl OpenParams {
    /// Minimal parameter set for opening an existing object.
    pub fn open(path: &str, access_mask: u32, share_access: u32) -> Self {
        Self {
            path: path.to_string(),
            access_mask,
            share_access,
            attributes: 0,
            allocation_size: 0,
            directory: false,
            overwrite: false,
        }
    }
}

/// How the driver completed a close.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseAction {
    /// The handle is gone.
    Completed,
    /// The driver finishes asynchronously; the FID stays in the table,
    /// flagged delayed, until the driver's completion runs.
    Delayed,
}

/// Seek origin for [`DiskInterface::seek_file`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SeekMode {
    Start,
    Current,
    End,
}

/// Attribute and size changes applied by the set-info family. Fields left
/// `None` keep their current values.
#[derive(Debug, Clone, Default)]
pub struct SetFileInfo {
    pub attributes: Option<u32>,
    pub creation: Option<NtTime>,
    pub access: Option<NtTime>,
    pub write: Option<NtTime>,
    pub change: Option<NtTime>,
    pub size: Option<u64>,
    pub allocation: Option<u64>,
}

impl SetFileInfo {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_none()
            && self.creation.is_none()
            && self.access.is_none()
            && self.write.is_none()
            && self.change.is_none()
            && self.size.is_none()
            && self.allocation.is_none()
    }
}

/// One byte-range lock or unlock, in the form the driver's lock manager
/// consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub pid: u32,
    pub offset: u64,
    pub length: u64,
    pub shared: bool,
}

/// Virtual filesystem interface bound to one shared device.
#[async_trait]
pub trait DiskInterface: Send + Sync {
    /// Existence and kind of the object at `path`.
    async fn file_exists(&self, path: &str) -> FileStatus;

    /// Opens an existing file or directory.
    async fn open_file(&self, params: &OpenParams) -> Result<DriverFileId>;

    /// Creates and opens a new file.
    async fn create_file(&self, params: &OpenParams) -> Result<DriverFileId>;

    /// Creates a directory.
    async fn create_directory(&self, params: &OpenParams) -> Result<()>;

    /// Closes an open file.
    async fn close_file(&self, file: DriverFileId) -> Result<CloseAction>;

    async fn read_file(&self, file: DriverFileId, offset: u64, length: u32) -> Result<Vec<u8>>;

    async fn write_file(&self, file: DriverFileId, offset: u64, data: &[u8]) -> Result<u32>;

    async fn truncate_file(&self, file: DriverFileId, size: u64) -> Result<()>;

    async fn flush_file(&self, file: DriverFileId) -> Result<()>;

    async fn seek_file(&self, file: DriverFileId, offset: i64, mode: SeekMode) -> Result<u64>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn delete_directory(&self, path: &str) -> Result<()>;

    async fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// Metadata of the object at `path`, `None` when it does not exist.
    async fn get_file_information(&self, path: &str) -> Result<Option<FileInfo>>;

    async fn set_file_information(&self, path: &str, info: &SetFileInfo) -> Result<()>;

    /// Starts a directory enumeration for a wildcard pattern. The pattern
    /// is a share-relative path whose last component may contain `*`/`?`.
    async fn start_search(&self, pattern: &str, attributes: u16) -> Result<Box<dyn SearchCursor>>;

    /// Static disk geometry. Drivers with live sizing implement
    /// [`DiskInterface::sizing`] instead.
    fn disk_info(&self) -> DiskInfo {
        DiskInfo { total_units: 0xFFFF, blocks_per_unit: 64, block_size: 512, free_units: 0x7FFF }
    }

    // --- capability probing ---

    /// NTFS named-stream support.
    fn streams(&self) -> Option<&dyn StreamsInterface> {
        None
    }

    /// Byte-range lock manager.
    fn lock_manager(&self) -> Option<&dyn LockManager> {
        None
    }

    /// Device ioctl pass-through.
    fn ioctl(&self) -> Option<&dyn IoctlInterface> {
        None
    }

    /// Security descriptor storage.
    fn security(&self) -> Option<&dyn SecurityDescriptorInterface> {
        None
    }

    /// Live disk sizing.
    fn sizing(&self) -> Option<&dyn DiskSizing> {
        None
    }

    /// Volume identity.
    fn volume(&self) -> Option<&dyn VolumeInterface> {
        None
    }
}

/// NTFS named-stream capability.
#[async_trait]
pub trait StreamsInterface: Send + Sync {
    /// Lists the named streams of a file, the unnamed data stream excluded.
    async fn stream_list(&self, path: &str) -> Result<Vec<StreamInfo>>;

    /// Renames a stream within a file.
    async fn rename_stream(&self, path: &str, from: &str, to: &str, overwrite: bool) -> Result<()>;
}

/// Byte-range lock capability. Lock state is in-memory bookkeeping, so the
/// interface is synchronous.
pub trait LockManager: Send + Sync {
    /// Acquires a lock; [`Error::LockConflict`] when an existing lock
    /// excludes it.
    fn lock_file(&self, file: DriverFileId, range: ByteRange) -> Result<()>;

    /// Releases a lock; [`Error::NotLocked`] when no matching range is
    /// held.
    fn unlock_file(&self, file: DriverFileId, range: ByteRange) -> Result<()>;

    /// Drops every lock the given owner process holds on a file.
    fn release_locks_for(&self, file: DriverFileId, pid: u32);
}

/// Device ioctl capability.
#[async_trait]
pub trait IoctlInterface: Send + Sync {
    /// Processes a device control request, returning the output data
    /// block. [`Error::NotSupported`] when the control code is unknown.
    async fn process_ioctl(&self, file: DriverFileId, control: u32, data: &[u8]) -> Result<Vec<u8>>;
}

/// Security descriptor capability.
#[async_trait]
pub trait SecurityDescriptorInterface: Send + Sync {
    /// Loads the self-relative descriptor for a path, filtered to the
    /// requested information bits.
    async fn load_descriptor(&self, path: &str, info: u32) -> Result<Vec<u8>>;

    /// Stores descriptor bytes for a path.
    async fn save_descriptor(&self, path: &str, info: u32, data: &[u8]) -> Result<()>;
}

/// Live disk sizing capability.
#[async_trait]
pub trait DiskSizing: Send + Sync {
    async fn disk_size_information(&self) -> Result<DiskInfo>;
}

/// Volume identity capability.
#[async_trait]
pub trait VolumeInterface: Send + Sync {
    async fn volume_information(&self) -> Result<VolumeInfo>;
}

/// Outcome of a share-connect authorization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShareStatus {
    NoAccess,
    ReadOnly,
    Writeable,
}

/// Authenticated client identity carried by a virtual circuit.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user: String,
    pub domain: String,
    /// A null session: anonymous, may only bind `IPC$`.
    pub null_session: bool,
}

/// Decoded session-setup security phase, produced by the transport-side
/// authentication collaborator.
#[derive(Debug, Clone)]
pub struct SessionSetupInfo {
    pub user: String,
    pub domain: String,
    pub password: Vec<u8>,
}

/// The authentication mechanism the engine consumes. NTLM/Kerberos
/// internals live behind this interface.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validates a session setup, yielding the client identity to attach
    /// to the new virtual circuit.
    async fn process_session_setup(&self, setup: &SessionSetupInfo) -> Result<ClientInfo>;

    /// Authorizes a tree connect, yielding the client's standing on the
    /// share.
    async fn authenticate_share_connect(
        &self,
        client: &ClientInfo,
        share: &str,
        password: &[u8],
    ) -> ShareStatus;
}

/// Permit-everything authenticator used when no real mechanism is wired up.
pub struct NullAuthenticator;

#[async_trait]
impl Authenticator for NullAuthenticator {
    async fn process_session_setup(&self, setup: &SessionSetupInfo) -> Result<ClientInfo> {
        Ok(ClientInfo {
            user: setup.user.clone(),
            domain: setup.domain.clone(),
            null_session: setup.user.is_empty(),
        })
    }

    async fn authenticate_share_connect(
        &self,
        _client: &ClientInfo,
        _share: &str,
        _password: &[u8],
    ) -> ShareStatus {
        ShareStatus::Writeable
    }
}
