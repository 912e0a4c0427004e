//! TRANS2 SET_PATH_INFORMATION / SET_FILE_INFORMATION.

use num_traits::FromPrimitive;

use crate::notify::NotifyEvent;
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, share_of, Control};
use crate::session::SmbSession;
use crate::smb1::{notify_filter, SetInfoLevel};
use crate::status::SmbStatus;
use crate::transact::{write_trans2_response, TransactBuffer};
use crate::vfs::file::NtTime;
use crate::vfs::SetFileInfo;

pub async fn set_path(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let level = SetInfoLevel::from_u16(pack::u16(&mut src)?).ok_or(SmbStatus::SrvNotSupported)?;
    let _reserved = pack::u32(&mut src)?;
    let path = if req.is_unicode() {
        pack::string_unicode(&mut src, crate::vfs::MAX_PATH_LEN)?
    } else {
        pack::string_ascii(&mut src, crate::vfs::MAX_PATH_LEN)?
    };
    apply(session, uid, tid, level, &path, None, buffer, resp).await
}

pub async fn set_file(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    _req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let fid = pack::u16(&mut src)?;
    let level = SetInfoLevel::from_u16(pack::u16(&mut src)?).ok_or(SmbStatus::SrvNotSupported)?;
    let path = find_open_file(session, uid, tid, fid)?.path.clone();
    apply(session, uid, tid, level, &path, Some(fid), buffer, resp).await
}

#[allow(clippy::too_many_arguments)]
async fn apply(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    level: SetInfoLevel,
    path: &str,
    fid: Option<u16>,
    buffer: &TransactBuffer,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let tree = vc.find_tree(tid).ok_or(SmbStatus::SrvInvalidTid)?;
        if !tree.has_write_permission() {
            return Err(SmbStatus::NTAccessDenied);
        }
    }
    let driver = disk_of(session, uid, tid)?;
    let share = share_of(session, uid, tid)?;
    let mut src = std::io::Cursor::new(buffer.data());

    match level {
        SetInfoLevel::Standard => {
            // SMB date/time triplet, 32-bit sizes, DOS attributes, EA length.
            let creation = smb_time(&mut src)?;
            let access = smb_time(&mut src)?;
            let write = smb_time(&mut src)?;
            let size = pack::u32(&mut src)? as u64;
            let allocation = pack::u32(&mut src)? as u64;
            let attributes = pack::u16(&mut src)? as u32;
            let info = SetFileInfo {
                attributes: Some(attributes),
                creation,
                access,
                write,
                size: (size != 0).then_some(size),
                allocation: (allocation != 0).then_some(allocation),
                ..Default::default()
            };
            driver.set_file_information(path, &info).await.map_err(SmbStatus::from)?;
            share.notify.post_event(&NotifyEvent::modified(path, notify_filter::ATTRIBUTES));
        }
        SetInfoLevel::Basic => {
            // Four 64-bit NT timestamps then the attribute mask. Zero
            // fields mean "leave unchanged".
            let creation = nt_time(&mut src)?;
            let access = nt_time(&mut src)?;
            let write = nt_time(&mut src)?;
            let change = nt_time(&mut src)?;
            let attributes = pack::u32(&mut src)?;
            let info = SetFileInfo {
                attributes: (attributes != 0).then_some(attributes),
                creation,
                access,
                write,
                change,
                ..Default::default()
            };
            if !info.is_empty() {
                driver.set_file_information(path, &info).await.map_err(SmbStatus::from)?;
            }
            share.notify.post_event(&NotifyEvent::modified(path, notify_filter::ATTRIBUTES));
        }
        SetInfoLevel::EndOfFile | SetInfoLevel::Allocation => {
            let size = pack::u64(&mut src)?;
            match fid.and_then(|f| {
                find_open_file(session, uid, tid, f).ok().map(|file| file.driver_file)
            }) {
                Some(handle) => driver.truncate_file(handle, size).await.map_err(SmbStatus::from)?,
                None => {
                    let info = SetFileInfo { size: Some(size), ..Default::default() };
                    driver.set_file_information(path, &info).await.map_err(SmbStatus::from)?;
                }
            }
            share.notify.post_event(&NotifyEvent::modified(path, notify_filter::SIZE));
        }
        SetInfoLevel::Disposition => {
            let delete = pack::u8(&mut src)? != 0;
            let fid = fid.ok_or(SmbStatus::SrvNotSupported)?;
            let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
            let tree = vc.find_tree_mut(tid).ok_or(SmbStatus::SrvInvalidTid)?;
            if delete && !tree.has_write_permission() {
                return Err(SmbStatus::NTAccessDenied);
            }
            let file = tree.find_file_mut(fid).ok_or(SmbStatus::DosInvalidHandle)?;
            file.delete_on_close = delete;
        }
        SetInfoLevel::Rename => {
            let overwrite = pack::u32(&mut src)? != 0;
            let _root_dir = pack::u32(&mut src)?;
            let name_len = pack::u32(&mut src)? as usize;
            let raw = pack::bytes(&mut src, name_len)?;
            let units: Vec<u16> =
                raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            let new_name = String::from_utf16(&units).map_err(|_| SmbStatus::NTInvalidParameter)?;

            if let Some(stream_name) = new_name.strip_prefix(':') {
                // Rename of a named stream within the file.
                let streams = driver
                    .streams()
                    .filter(|_| session.config.ntfs_streams)
                    .ok_or(SmbStatus::SrvNotSupported)?;
                let (base, old_stream) =
                    path.split_once(':').ok_or(SmbStatus::NTInvalidParameter)?;
                streams
                    .rename_stream(base, old_stream, stream_name, overwrite)
                    .await
                    .map_err(SmbStatus::from)?;
            } else {
                // Plain rename within the same directory.
                let dir = path.rsplit_once('\\').map(|(d, _)| d).unwrap_or("");
                let to = format!("{dir}\\{new_name}");
                if !overwrite
                    && driver.file_exists(&to).await != crate::vfs::FileStatus::NotExist
                {
                    return Err(SmbStatus::NTObjectNameCollision);
                }
                driver.rename_file(path, &to).await.map_err(SmbStatus::from)?;
                share.notify.post_event(&NotifyEvent::renamed(path, &to, false));
            }
        }
        SetInfoLevel::SetEas => return Err(SmbStatus::SrvNotSupported),
    }

    write_trans2_response(resp, &[0, 0], &[]);
    Ok(Control::Reply)
}

fn smb_time(src: &mut impl std::io::Read) -> Result<Option<NtTime>, SmbStatus> {
    let time = pack::u16(src)?;
    let date = pack::u16(src)?;
    if date == 0 && time == 0 {
        return Ok(None);
    }
    Ok(Some(NtTime::from_smb_date_time(date, time)))
}

fn nt_time(src: &mut impl std::io::Read) -> Result<Option<NtTime>, SmbStatus> {
    let raw = pack::u64(src)?;
    // Zero and -1 both mean "do not change".
    if raw == 0 || raw == u64::MAX {
        return Ok(None);
    }
    Ok(Some(NtTime(raw)))
}
