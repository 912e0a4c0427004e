//! SMB1 (CIFS) protocol constants: command codes, header flags, transaction
//! sub-functions, information levels and file attributes.

#![allow(dead_code)]

use num_derive::{FromPrimitive, ToPrimitive};

/// Protocol signature following the NBT length prefix: `0xFF 'S' 'M' 'B'`.
pub const SIGNATURE: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// Fixed SMB1 header length, signature included, NBT prefix excluded.
pub const HEADER_LEN: usize = 32;

/// Length of the NBT framing prefix carried in front of every SMB frame.
pub const NBT_HEADER_LEN: usize = 4;

/// Dialect selected by this server during negotiation.
pub const DIALECT_NT_LM_012: &str = "NT LM 0.12";

/// Largest client buffer the server announces during negotiation.
pub const DEFAULT_MAX_BUFFER: u16 = 0xFFFF;

/// SMB1 command codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Command {
    CreateDirectory = 0x00,
    DeleteDirectory = 0x01,
    OpenFile = 0x02,
    CreateFile = 0x03,
    CloseFile = 0x04,
    FlushFile = 0x05,
    DeleteFile = 0x06,
    RenameFile = 0x07,
    GetFileAttributes = 0x08,
    SetFileAttributes = 0x09,
    ReadFile = 0x0A,
    WriteFile = 0x0B,
    LockFile = 0x0C,
    UnLockFile = 0x0D,
    CheckDirectory = 0x10,
    ProcessExit = 0x11,
    SeekFile = 0x12,
    LockAndRead = 0x13,
    WriteAndUnlock = 0x14,
    ReadRaw = 0x1A,
    WriteRaw = 0x1D,
    SetInformation2 = 0x22,
    QueryInformation2 = 0x23,
    LockingAndX = 0x24,
    Transaction = 0x25,
    Transaction2 = 0x32,
    TransactionSecond = 0x26,
    Transaction2Second = 0x33,
    FindClose2 = 0x34,
    IOCtl = 0x27,
    Echo = 0x2B,
    WriteAndClose = 0x2C,
    OpenAndX = 0x2D,
    ReadAndX = 0x2E,
    WriteAndX = 0x2F,
    TreeDisconnect = 0x71,
    Negotiate = 0x72,
    SessionSetupAndX = 0x73,
    LogoffAndX = 0x74,
    TreeConnectAndX = 0x75,
    TreeConnect = 0x70,
    DiskInformation = 0x80,
    Search = 0x81,
    Find = 0x82,
    FindUnique = 0x83,
    NTTransact = 0xA0,
    NTTransactSecond = 0xA1,
    NTCreateAndX = 0xA2,
    NTCancel = 0xA4,
}

/// AndX chain terminator value for the `next command` slot.
pub const NO_ANDX_CMD: u8 = 0xFF;

/// Header `flags` bits.
pub mod flags {
    /// Paths are case insensitive.
    pub const CASELESS: u8 = 0x08;
    /// Frame is a response.
    pub const RESPONSE: u8 = 0x80;
}

/// Header `flags2` bits.
pub mod flags2 {
    /// Client understands long (non-8.3) file names.
    pub const LONG_FILENAMES: u16 = 0x0001;
    /// Client understands extended attributes.
    pub const EXTENDED_ATTRIBUTES: u16 = 0x0002;
    /// Security signatures are in use on this session.
    pub const SECURITY_SIGNATURES: u16 = 0x0004;
    /// Extended security negotiation.
    pub const EXTENDED_SECURITY: u16 = 0x0800;
    /// Path may resolve through DFS.
    pub const DFS_RESOLVE: u16 = 0x1000;
    /// Read-if-execute permission semantics.
    pub const READ_IF_EXE: u16 = 0x2000;
    /// Status field carries a 32-bit NT status instead of class+code.
    pub const LONG_ERROR_CODE: u16 = 0x4000;
    /// Strings in the byte block are UCS-2.
    pub const UNICODE: u16 = 0x8000;
}

/// Server capability bits announced in the negotiate response.
pub mod capability {
    pub const RAW_MODE: u32 = 0x0001;
    pub const MPX_MODE: u32 = 0x0002;
    pub const UNICODE: u32 = 0x0004;
    pub const LARGE_FILES: u32 = 0x0008;
    pub const NT_SMBS: u32 = 0x0010;
    pub const RPC_APIS: u32 = 0x0020;
    pub const NT_STATUS: u32 = 0x0040;
    pub const LEVEL_II_OPLOCKS: u32 = 0x0080;
    pub const LOCK_AND_READ: u32 = 0x0100;
    pub const NT_FIND: u32 = 0x0200;
    pub const LARGE_READ: u32 = 0x4000;
    pub const LARGE_WRITE: u32 = 0x8000;
}

/// DOS file attribute bits carried by the legacy commands.
pub mod attr {
    pub const READ_ONLY: u16 = 0x0001;
    pub const HIDDEN: u16 = 0x0002;
    pub const SYSTEM: u16 = 0x0004;
    pub const VOLUME: u16 = 0x0008;
    pub const DIRECTORY: u16 = 0x0010;
    pub const ARCHIVE: u16 = 0x0020;

    /// Mask of the attribute bits a legacy SEARCH entry may carry.
    pub const STANDARD_MASK: u16 = 0x003F;
}

/// NT extended file attribute bits (`ExtFileAttributes`).
pub mod nt_attr {
    pub const READ_ONLY: u32 = 0x0000_0001;
    pub const HIDDEN: u32 = 0x0000_0002;
    pub const SYSTEM: u32 = 0x0000_0004;
    pub const DIRECTORY: u32 = 0x0000_0010;
    pub const ARCHIVE: u32 = 0x0000_0020;
    pub const NORMAL: u32 = 0x0000_0080;
}

/// TRANS2 sub-function codes, carried in the first setup word.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Trans2 {
    Open = 0x00,
    FindFirst = 0x01,
    FindNext = 0x02,
    QueryFsInfo = 0x03,
    SetFsInfo = 0x04,
    QueryPath = 0x05,
    SetPath = 0x06,
    QueryFile = 0x07,
    SetFile = 0x08,
    Fsctl = 0x09,
    IOCtl2 = 0x0A,
    FindNotifyFirst = 0x0B,
    FindNotifyNext = 0x0C,
    CreateDirectory = 0x0D,
}

/// NT_TRANSACT function codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum NTTransact {
    Create = 1,
    IOCtl = 2,
    SetSecurityDesc = 3,
    NotifyChange = 4,
    Rename = 5,
    QuerySecurityDesc = 6,
}

/// Information levels for TRANS2 QUERY_PATH/FILE_INFORMATION.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum QueryInfoLevel {
    Standard = 0x0001,
    QueryEaSize = 0x0002,
    QueryEasFromList = 0x0003,
    AllEas = 0x0004,
    Basic = 0x0101,
    StandardNT = 0x0102,
    Ea = 0x0103,
    Name = 0x0104,
    All = 0x0107,
    AltName = 0x0108,
    Stream = 0x0109,
    Compression = 0x010B,
}

/// Information levels for TRANS2 SET_PATH/FILE_INFORMATION.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum SetInfoLevel {
    Standard = 0x0001,
    SetEas = 0x0002,
    Basic = 0x0101,
    Disposition = 0x0102,
    Allocation = 0x0103,
    EndOfFile = 0x0104,
    /// NT pass-through rename, used for stream renames.
    Rename = 0x0202,
}

/// Information levels for TRANS2 FIND_FIRST2/FIND_NEXT2 entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum FindInfoLevel {
    Standard = 0x0001,
    QueryEaSize = 0x0002,
    Directory = 0x0101,
    FullDirectory = 0x0102,
    Names = 0x0103,
    BothDirectory = 0x0104,
}

/// Information levels for TRANS2 QUERY_FS_INFORMATION.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum FsInfoLevel {
    Standard = 0x0001,
    Volume = 0x0002,
    FsVolume = 0x0102,
    FsSize = 0x0103,
    FsDevice = 0x0104,
    FsAttribute = 0x0105,
    MacFsInfo = 0x0301,
    FullFsSize = 0x03EF,
}

/// FIND_FIRST2/FIND_NEXT2 request flag bits.
pub mod find_flags {
    /// Free the search slot after this response.
    pub const CLOSE_SEARCH: u16 = 0x0001;
    /// Free the slot once the end of the listing is reached.
    pub const CLOSE_AT_END: u16 = 0x0002;
    /// Prefix each entry with a 4-byte resume key.
    pub const RETURN_RESUME_KEY: u16 = 0x0004;
    /// Resume from the supplied resume key rather than the last entry.
    pub const CONTINUE_FROM_LAST: u16 = 0x0008;
    pub const BACKUP_INTENT: u16 = 0x0010;
}

/// LockingAndX `TypeOfLock` bits.
pub mod lock_type {
    /// Entry describes a shared (read) lock.
    pub const SHARED: u8 = 0x01;
    /// Frame is an oplock break acknowledgement / notification.
    pub const OPLOCK_BREAK: u8 = 0x02;
    pub const CHANGE_TYPE: u8 = 0x04;
    pub const CANCEL: u8 = 0x08;
    /// Lock ranges use the 64-bit large-file layout.
    pub const LARGE_FILES: u8 = 0x10;
}

/// Oplock level byte used in NT_CREATE_ANDX responses and break frames.
pub mod oplock_level {
    pub const NONE: u8 = 0x00;
    pub const EXCLUSIVE: u8 = 0x01;
    pub const BATCH: u8 = 0x02;
    pub const LEVEL_II: u8 = 0x03;
}

/// NT_CREATE_ANDX request flag bits.
pub mod nt_create_flags {
    pub const REQUEST_OPLOCK: u32 = 0x0002;
    pub const REQUEST_BATCH_OPLOCK: u32 = 0x0004;
    pub const OPEN_TARGET_DIR: u32 = 0x0008;
}

/// NT create disposition values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    Open = 1,
    Create = 2,
    OpenIf = 3,
    Overwrite = 4,
    OverwriteIf = 5,
}

/// NT desired-access bits the engine interprets.
pub mod access {
    pub const READ_DATA: u32 = 0x0000_0001;
    pub const WRITE_DATA: u32 = 0x0000_0002;
    pub const APPEND_DATA: u32 = 0x0000_0004;
    pub const READ_EA: u32 = 0x0000_0008;
    pub const WRITE_EA: u32 = 0x0000_0010;
    pub const EXECUTE: u32 = 0x0000_0020;
    pub const READ_ATTRIBUTES: u32 = 0x0000_0080;
    pub const WRITE_ATTRIBUTES: u32 = 0x0000_0100;
    pub const DELETE: u32 = 0x0001_0000;
    pub const WRITE_DAC: u32 = 0x0004_0000;
    pub const GENERIC_ALL: u32 = 0x1000_0000;
    pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_READ: u32 = 0x8000_0000;

    /// Bits that touch file data rather than metadata.
    pub const DATA_MASK: u32 =
        READ_DATA | WRITE_DATA | APPEND_DATA | EXECUTE | GENERIC_READ | GENERIC_WRITE | GENERIC_ALL;

    /// `true` when the request opens the object for attributes only.
    pub fn is_attributes_only(mask: u32) -> bool {
        mask != 0 && mask & DATA_MASK == 0 && mask & DELETE == 0
    }
}

/// NT share-access bits.
pub mod share_access {
    pub const NONE: u32 = 0x0000;
    pub const READ: u32 = 0x0001;
    pub const WRITE: u32 = 0x0002;
    pub const DELETE: u32 = 0x0004;
}

/// Change-notification filter bits (NT_TRANSACT NOTIFY_CHANGE).
pub mod notify_filter {
    pub const FILE_NAME: u32 = 0x0001;
    pub const DIR_NAME: u32 = 0x0002;
    pub const ATTRIBUTES: u32 = 0x0004;
    pub const SIZE: u32 = 0x0008;
    pub const LAST_WRITE: u32 = 0x0010;
    pub const LAST_ACCESS: u32 = 0x0020;
    pub const CREATION: u32 = 0x0040;
    pub const EA: u32 = 0x0080;
    pub const SECURITY: u32 = 0x0100;
    pub const STREAM_NAME: u32 = 0x0200;
    pub const STREAM_SIZE: u32 = 0x0400;
    pub const STREAM_WRITE: u32 = 0x0800;
}

/// Change-notification action codes carried in event records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum NotifyAction {
    Added = 1,
    Removed = 2,
    Modified = 3,
    RenamedOldName = 4,
    RenamedNewName = 5,
    AddedStream = 6,
    RemovedStream = 7,
    ModifiedStream = 8,
}

/// Marker suffix that addresses the unnamed NTFS data stream.
pub const DATA_STREAM_MARKER: &str = ":$DATA";

/// Resume-key entry-id sentinels used by the legacy SEARCH command.
pub mod resume_id {
    /// Enumeration has not produced any entry yet.
    pub const START: u16 = 0x8003;
    /// The synthetic "." entry has been returned.
    pub const DOT: u16 = 0x8002;
    /// The synthetic ".." entry has been returned.
    pub const DOT_DOT: u16 = 0x8001;
}

/// Wildcard pattern Windows Explorer leaks search slots with.
pub const EXPLORER_PATTERN: &str = "????????.???";

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_command_codes_round_trip() {
        assert_eq!(Command::from_u8(0x75), Some(Command::TreeConnectAndX));
        assert_eq!(Command::from_u8(0xA2), Some(Command::NTCreateAndX));
        assert_eq!(Command::from_u8(0x81), Some(Command::Search));
        assert_eq!(Command::from_u8(0xFE), None);
    }

    #[test]
    fn test_attributes_only_mask() {
        assert!(access::is_attributes_only(access::READ_ATTRIBUTES));
        assert!(access::is_attributes_only(access::READ_ATTRIBUTES | access::WRITE_ATTRIBUTES));
        assert!(!access::is_attributes_only(access::READ_DATA));
        assert!(!access::is_attributes_only(access::READ_ATTRIBUTES | access::DELETE));
        assert!(!access::is_attributes_only(0));
    }
}
