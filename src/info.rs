//! Information-level packers.
//!
//! Every query/find/fs info level the transaction sub-commands can ask
//! for is written by one pure function here; this module is the single
//! place the protocol-level layouts are defined. All packers append to a
//! caller-supplied buffer and return nothing or the record's start offset
//! (for chained find records).

#![allow(dead_code)]

use crate::pack;
use crate::smb1::{FindInfoLevel, FsInfoLevel, QueryInfoLevel};
use crate::status::SmbStatus;
use crate::vfs::file::{DiskInfo, FileInfo, NtTime, StreamInfo, VolumeInfo};

/// Appends an SMB (DOS) date/time pair: 16-bit time then 16-bit date.
fn put_smb_date_time(out: &mut Vec<u8>, t: NtTime) {
    let (date, time) = t.to_smb_date_time();
    pack::put_u16(out, time);
    pack::put_u16(out, date);
}

/// Appends a UTF-16 string with no terminator, returning its byte length.
fn put_unicode_bare(out: &mut Vec<u8>, s: &str) -> u32 {
    let start = out.len();
    for unit in s.encode_utf16() {
        pack::put_u16(out, unit);
    }
    (out.len() - start) as u32
}

// --- QUERY_PATH/FILE_INFORMATION ---

/// Packs a query-info response data block for `level`.
pub fn pack_query_info(
    level: QueryInfoLevel,
    info: &FileInfo,
    unicode: bool,
) -> Result<Vec<u8>, SmbStatus> {
    let mut out = Vec::new();
    match level {
        QueryInfoLevel::Standard => pack_info_standard(&mut out, info, false),
        QueryInfoLevel::QueryEaSize => pack_info_standard(&mut out, info, true),
        QueryInfoLevel::Basic => pack_basic(&mut out, info),
        QueryInfoLevel::StandardNT => pack_standard_nt(&mut out, info),
        QueryInfoLevel::Ea => pack::put_u32(&mut out, 0),
        QueryInfoLevel::Name => pack_name(&mut out, &info.file_name, unicode),
        QueryInfoLevel::All => {
            pack_basic(&mut out, info);
            pack_standard_nt(&mut out, info);
            pack::put_u32(&mut out, 0); // EA size
            pack_name(&mut out, &info.file_name, unicode);
        }
        QueryInfoLevel::AltName => {
            pack_name(&mut out, &crate::search::dos_name(&info.file_name), unicode)
        }
        QueryInfoLevel::Compression => {
            pack::put_u64(&mut out, info.size);
            pack::put_u16(&mut out, 0); // compression format: none
            pack::put_u8(&mut out, 0); // unit shift
            pack::put_u8(&mut out, 0); // chunk shift
            pack::put_u8(&mut out, 0); // cluster shift
            pack::put_zeros(&mut out, 3);
        }
        // Stream lists come from the driver's stream interface, not from
        // a FileInfo; the query-info handler packs them separately.
        QueryInfoLevel::Stream | QueryInfoLevel::QueryEasFromList | QueryInfoLevel::AllEas => {
            return Err(SmbStatus::SrvNotSupported)
        }
    }
    Ok(out)
}

/// `SMB_INFO_STANDARD` / `SMB_INFO_QUERY_EA_SIZE`: SMB date/time triplet,
/// 32-bit sizes, DOS attributes.
fn pack_info_standard(out: &mut Vec<u8>, info: &FileInfo, with_ea: bool) {
    put_smb_date_time(out, info.creation);
    put_smb_date_time(out, info.access);
    put_smb_date_time(out, info.write);
    pack::put_u32(out, info.size as u32);
    pack::put_u32(out, info.allocation as u32);
    pack::put_u16(out, info.attributes as u16);
    if with_ea {
        pack::put_u32(out, 0);
    }
}

/// `SMB_QUERY_FILE_BASIC_INFO`: four NT timestamps, attributes, reserved.
fn pack_basic(out: &mut Vec<u8>, info: &FileInfo) {
    pack::put_u64(out, info.creation.0);
    pack::put_u64(out, info.access.0);
    pack::put_u64(out, info.write.0);
    pack::put_u64(out, info.change.0);
    pack::put_u32(out, info.attributes);
    pack::put_zeros(out, 4);
}

/// `SMB_QUERY_FILE_STANDARD_INFO`.
fn pack_standard_nt(out: &mut Vec<u8>, info: &FileInfo) {
    pack::put_u64(out, info.allocation);
    pack::put_u64(out, info.size);
    pack::put_u32(out, 1); // link count
    pack::put_u8(out, 0); // delete pending
    pack::put_u8(out, u8::from(info.is_directory()));
    pack::put_zeros(out, 2);
}

fn pack_name(out: &mut Vec<u8>, name: &str, unicode: bool) {
    if unicode {
        let len_at = out.len();
        pack::put_u32(out, 0);
        let len = put_unicode_bare(out, name);
        pack::set_u32(out, len_at, len);
    } else {
        pack::put_u32(out, name.len() as u32);
        for c in name.chars() {
            out.push(if c.is_ascii() { c as u8 } else { b'?' });
        }
    }
}

/// Packs a `FileStreamInformation` list for the stream info level.
/// Records are 8-aligned; the unnamed data stream is reported first.
pub fn pack_stream_list(size: u64, allocation: u64, streams: &[StreamInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut record_starts = Vec::new();

    let mut all = vec![StreamInfo { name: "::$DATA".to_string(), size, allocation }];
    all.extend(streams.iter().cloned());

    for (idx, stream) in all.iter().enumerate() {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let start = out.len();
        record_starts.push(start);
        pack::put_u32(&mut out, 0); // next offset, patched below
        let len_at = out.len();
        pack::put_u32(&mut out, 0);
        pack::put_u64(&mut out, stream.size);
        pack::put_u64(&mut out, stream.allocation);
        let len = put_unicode_bare(&mut out, &stream.name);
        pack::set_u32(&mut out, len_at, len);

        if idx + 1 < all.len() {
            let mut next = out.len();
            while next % 8 != 0 {
                next += 1;
            }
            pack::set_u32(&mut out, start, (next - start) as u32);
        }
    }
    out
}

// --- FIND_FIRST2 / FIND_NEXT2 entries ---

/// Appends one find entry, returning the record's start offset within
/// `out`, or `None` when appending it would exceed `limit` (the caller
/// then rewinds the cursor and flushes what it has).
pub fn pack_find_entry(
    out: &mut Vec<u8>,
    level: FindInfoLevel,
    info: &FileInfo,
    resume_id: u32,
    resume_keys: bool,
    unicode: bool,
    limit: usize,
) -> Option<usize> {
    let rollback = out.len();
    let start = match level {
        FindInfoLevel::Standard | FindInfoLevel::QueryEaSize => {
            let start = out.len();
            // Resume keys are honored only at the standard levels.
            if resume_keys {
                pack::put_u32(out, resume_id);
            }
            put_smb_date_time(out, info.creation);
            put_smb_date_time(out, info.access);
            put_smb_date_time(out, info.write);
            pack::put_u32(out, info.size as u32);
            pack::put_u32(out, info.allocation as u32);
            pack::put_u16(out, info.attributes as u16);
            if level == FindInfoLevel::QueryEaSize {
                pack::put_u32(out, 0);
            }
            let name_bytes = if unicode {
                info.file_name.encode_utf16().count() * 2
            } else {
                info.file_name.len()
            };
            pack::put_u8(out, name_bytes as u8);
            pack::put_string(out, &info.file_name, unicode, 0);
            start
        }
        FindInfoLevel::Directory
        | FindInfoLevel::FullDirectory
        | FindInfoLevel::BothDirectory => {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let start = out.len();
            pack::put_u32(out, 0); // next entry offset, caller-patched
            pack::put_u32(out, resume_id); // file index
            pack::put_u64(out, info.creation.0);
            pack::put_u64(out, info.access.0);
            pack::put_u64(out, info.write.0);
            pack::put_u64(out, info.change.0);
            pack::put_u64(out, info.size);
            pack::put_u64(out, info.allocation);
            pack::put_u32(out, info.attributes);
            let len_at = out.len();
            pack::put_u32(out, 0);
            if level != FindInfoLevel::Directory {
                pack::put_u32(out, 0); // EA size
            }
            if level == FindInfoLevel::BothDirectory {
                let short = crate::search::dos_name(&info.file_name);
                pack::put_u8(out, (short.encode_utf16().count() * 2) as u8);
                pack::put_u8(out, 0);
                let mut field = Vec::new();
                put_unicode_bare(&mut field, &short);
                field.resize(24, 0);
                pack::put_bytes(out, &field);
            }
            let len = if unicode {
                put_unicode_bare(out, &info.file_name)
            } else {
                let l = info.file_name.len() as u32;
                for c in info.file_name.chars() {
                    out.push(if c.is_ascii() { c as u8 } else { b'?' });
                }
                l
            };
            pack::set_u32(out, len_at, len);
            start
        }
        FindInfoLevel::Names => {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let start = out.len();
            pack::put_u32(out, 0);
            pack::put_u32(out, resume_id);
            let len_at = out.len();
            pack::put_u32(out, 0);
            let len = put_unicode_bare(out, &info.file_name);
            pack::set_u32(out, len_at, len);
            start
        }
    };
    if out.len() > limit {
        out.truncate(rollback);
        return None;
    }
    Some(start)
}

/// Patches a chained find record's next-entry offset once the following
/// record's position is known.
pub fn set_next_entry_offset(out: &mut [u8], record_start: usize, next_start: usize) {
    pack::set_u32(out, record_start, (next_start - record_start) as u32);
}

/// `true` for find levels whose records chain via a next-entry offset.
pub fn find_level_is_chained(level: FindInfoLevel) -> bool {
    !matches!(level, FindInfoLevel::Standard | FindInfoLevel::QueryEaSize)
}

// --- QUERY_FS_INFORMATION ---

/// Packs a filesystem info level from the disk geometry and volume
/// identity the driver supplied.
pub fn pack_fs_info(
    level: FsInfoLevel,
    disk: &DiskInfo,
    volume: &VolumeInfo,
    fs_name: &str,
    unicode: bool,
) -> Result<Vec<u8>, SmbStatus> {
    let mut out = Vec::new();
    match level {
        FsInfoLevel::Standard => {
            pack::put_u32(&mut out, 0); // filesystem id
            pack::put_u32(&mut out, disk.blocks_per_unit);
            pack::put_u32(&mut out, disk.total_units as u32);
            pack::put_u32(&mut out, disk.free_units as u32);
            pack::put_u16(&mut out, disk.block_size as u16);
        }
        FsInfoLevel::Volume => {
            pack::put_u32(&mut out, volume.serial);
            pack::put_u8(&mut out, volume.label.len() as u8);
            pack::put_string(&mut out, &volume.label, unicode, 0);
        }
        FsInfoLevel::FsVolume => {
            pack::put_u64(&mut out, volume.created.0);
            pack::put_u32(&mut out, volume.serial);
            let len_at = out.len();
            pack::put_u32(&mut out, 0);
            pack::put_zeros(&mut out, 2); // supports objects + reserved
            let len = put_unicode_bare(&mut out, &volume.label);
            pack::set_u32(&mut out, len_at, len);
        }
        FsInfoLevel::FsSize => {
            pack::put_u64(&mut out, disk.total_units);
            pack::put_u64(&mut out, disk.free_units);
            pack::put_u32(&mut out, disk.blocks_per_unit);
            pack::put_u32(&mut out, disk.block_size);
        }
        FsInfoLevel::FsDevice => {
            pack::put_u32(&mut out, 0x0000_0007); // FILE_DEVICE_DISK
            pack::put_u32(&mut out, 0);
        }
        FsInfoLevel::FsAttribute => {
            // Case-preserving + case-sensitive-capable; streams and the
            // name cap are what the handler passed through `fs_name`.
            pack::put_u32(&mut out, 0x0000_0003);
            pack::put_u32(&mut out, 255);
            let len_at = out.len();
            pack::put_u32(&mut out, 0);
            let len = put_unicode_bare(&mut out, fs_name);
            pack::set_u32(&mut out, len_at, len);
        }
        FsInfoLevel::FullFsSize => {
            pack::put_u64(&mut out, disk.total_units);
            pack::put_u64(&mut out, disk.free_units); // caller-available
            pack::put_u64(&mut out, disk.free_units); // actual free
            pack::put_u32(&mut out, disk.blocks_per_unit);
            pack::put_u32(&mut out, disk.block_size);
        }
        FsInfoLevel::MacFsInfo => return Err(SmbStatus::SrvNotSupported),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileInfo {
        FileInfo {
            file_name: "a.txt".to_string(),
            size: 0x1234,
            allocation: 0x2000,
            attributes: crate::smb1::nt_attr::ARCHIVE,
            creation: NtTime::from_unix_seconds(1_000_000_000),
            access: NtTime::from_unix_seconds(1_000_000_100),
            write: NtTime::from_unix_seconds(1_000_000_200),
            change: NtTime::from_unix_seconds(1_000_000_200),
            file_id: 42,
        }
    }

    #[test]
    fn test_info_standard_layout() {
        let out = pack_query_info(QueryInfoLevel::Standard, &sample(), true).unwrap();
        assert_eq!(out.len(), 22);
        assert_eq!(pack::get_u32(&out, 12), 0x1234);
        assert_eq!(pack::get_u32(&out, 16), 0x2000);
        assert_eq!(pack::get_u16(&out, 20), crate::smb1::nt_attr::ARCHIVE as u16);

        let with_ea = pack_query_info(QueryInfoLevel::QueryEaSize, &sample(), true).unwrap();
        assert_eq!(with_ea.len(), 26);
    }

    #[test]
    fn test_basic_and_standard_nt_layouts() {
        let info = sample();
        let basic = pack_query_info(QueryInfoLevel::Basic, &info, true).unwrap();
        assert_eq!(basic.len(), 40);
        assert_eq!(pack::get_u32(&basic, 32), info.attributes);

        let std_nt = pack_query_info(QueryInfoLevel::StandardNT, &info, true).unwrap();
        assert_eq!(std_nt.len(), 24);
        assert_eq!(std_nt[21], 0); // not a directory
    }

    #[test]
    fn test_all_info_is_composite() {
        let info = sample();
        let all = pack_query_info(QueryInfoLevel::All, &info, true).unwrap();
        // basic + standard + ea + name length + UTF-16 name
        assert_eq!(all.len(), 40 + 24 + 4 + 4 + info.file_name.len() * 2);
        let name_len = pack::get_u32(&all, 68) as usize;
        assert_eq!(name_len, info.file_name.len() * 2);
    }

    #[test]
    fn test_name_ascii_form() {
        let out = pack_query_info(QueryInfoLevel::Name, &sample(), false).unwrap();
        assert_eq!(pack::get_u32(&out, 0), 5);
        assert_eq!(&out[4..], b"a.txt");
    }

    #[test]
    fn test_stream_list_reports_data_stream_first() {
        let streams = vec![StreamInfo { name: ":tag:$DATA".to_string(), size: 7, allocation: 8 }];
        let out = pack_stream_list(100, 128, &streams);
        // First record: unnamed data stream.
        let name_len = pack::get_u32(&out, 4) as usize;
        assert_eq!(name_len, "::$DATA".len() * 2);
        assert_eq!(pack::get_u64(&out, 8), 100);
        // Chained to the named stream on an 8-byte boundary.
        let next = pack::get_u32(&out, 0) as usize;
        assert_ne!(next, 0);
        assert_eq!(next % 8, 0);
        assert_eq!(pack::get_u32(&out, next) as usize, 0);
    }

    #[test]
    fn test_find_standard_with_resume_key() {
        let mut out = Vec::new();
        let start =
            pack_find_entry(&mut out, FindInfoLevel::Standard, &sample(), 7, true, false, 512)
                .unwrap();
        assert_eq!(start, 0);
        assert_eq!(pack::get_u32(&out, 0), 7);
        // 4 resume + 12 dates + 8 sizes + 2 attrs + 1 name length.
        assert_eq!(out[26] as usize, 5);
        assert_eq!(&out[27..32], b"a.txt");

        let mut out = Vec::new();
        pack_find_entry(&mut out, FindInfoLevel::Standard, &sample(), 7, false, false, 512)
            .unwrap();
        assert_eq!(out[22] as usize, 5);
    }

    #[test]
    fn test_find_directory_chaining() {
        let mut out = Vec::new();
        let first =
            pack_find_entry(&mut out, FindInfoLevel::Directory, &sample(), 1, false, true, 4096)
                .unwrap();
        let second =
            pack_find_entry(&mut out, FindInfoLevel::Directory, &sample(), 2, false, true, 4096)
                .unwrap();
        set_next_entry_offset(&mut out, first, second);
        assert_eq!(second % 4, 0);
        assert_eq!(pack::get_u32(&out, first) as usize, second - first);
        // Fixed part is 64 bytes before the name.
        assert_eq!(pack::get_u32(&out, first + 60) as usize, 5 * 2);
    }

    #[test]
    fn test_find_both_directory_short_name_field() {
        let mut out = Vec::new();
        let info = FileInfo { file_name: "averylongname.text".to_string(), ..sample() };
        pack_find_entry(&mut out, FindInfoLevel::BothDirectory, &info, 1, false, true, 4096)
            .unwrap();
        // Short-name field sits after the 68-byte fixed part: length byte,
        // reserved byte, then 24 bytes of UTF-16 short name.
        let short_len = out[68] as usize;
        assert_eq!(short_len, "AVERYLON.TEX".len() * 2);
        assert_eq!(pack::get_u16(&out, 70), b'A' as u16);
    }

    #[test]
    fn test_find_entry_respects_limit() {
        let mut out = vec![0u8; 16];
        let r = pack_find_entry(&mut out, FindInfoLevel::Directory, &sample(), 1, false, true, 32);
        assert!(r.is_none());
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn test_fs_size_layout() {
        let disk =
            DiskInfo { total_units: 1000, blocks_per_unit: 64, block_size: 512, free_units: 500 };
        let volume = VolumeInfo { label: "DATA".into(), serial: 0xDEAD, created: NtTime(0) };
        let out = pack_fs_info(FsInfoLevel::FsSize, &disk, &volume, "NTFS", true).unwrap();
        assert_eq!(out.len(), 24);
        assert_eq!(pack::get_u64(&out, 0), 1000);
        assert_eq!(pack::get_u64(&out, 8), 500);
        assert_eq!(pack::get_u32(&out, 16), 64);
        assert_eq!(pack::get_u32(&out, 20), 512);
    }

    #[test]
    fn test_fs_attribute_carries_fs_name() {
        let disk =
            DiskInfo { total_units: 1, blocks_per_unit: 1, block_size: 512, free_units: 1 };
        let volume = VolumeInfo { label: String::new(), serial: 0, created: NtTime(0) };
        let out = pack_fs_info(FsInfoLevel::FsAttribute, &disk, &volume, "NTFS", true).unwrap();
        assert_eq!(pack::get_u32(&out, 8) as usize, 8);
        assert_eq!(pack::get_u16(&out, 12), b'N' as u16);

        assert!(pack_fs_info(FsInfoLevel::MacFsInfo, &disk, &volume, "NTFS", true).is_err());
    }
}
