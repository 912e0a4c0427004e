//! The core attribute commands: QUERY/SET_INFORMATION(2) and
//! QUERY_INFORMATION_DISK.

use crate::notify::NotifyEvent;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, share_of, Control};
use crate::session::SmbSession;
use crate::smb1::notify_filter;
use crate::status::SmbStatus;
use crate::vfs::file::NtTime;
use crate::vfs::SetFileInfo;

/// QUERY_INFORMATION: DOS attributes, UTIME modification time, 32-bit
/// size.
pub async fn query_information(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let (path, _) = super::read_legacy_path(req, 0)?;
    let driver = disk_of(session, uid, tid)?;
    let info = driver
        .get_file_information(&path)
        .await
        .map_err(SmbStatus::from)?
        .ok_or(SmbStatus::NTObjectNotFound)?;

    resp.begin_block(10);
    resp.set_param_u16(0, info.attributes as u16);
    resp.set_param_u32(1, info.write.unix_seconds() as u32);
    resp.set_param_u32(3, info.size as u32);
    resp.finish_block();
    Ok(Control::Reply)
}

/// SET_INFORMATION: DOS attributes and UTIME modification time.
pub async fn set_information(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let attributes = req.param_u16(0) as u32;
    let utime = req.param_u32(1);
    let (path, _) = super::read_legacy_path(req, 0)?;

    let driver = disk_of(session, uid, tid)?;
    let info = SetFileInfo {
        attributes: Some(attributes),
        write: (utime != 0).then(|| NtTime::from_unix_seconds(utime as u64)),
        ..Default::default()
    };
    driver.set_file_information(&path, &info).await.map_err(SmbStatus::from)?;
    share_of(session, uid, tid)?
        .notify
        .post_event(&NotifyEvent::modified(&path, notify_filter::ATTRIBUTES));

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// QUERY_INFORMATION2: the FID-addressed date/time form.
pub async fn query_information2(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let path = find_open_file(session, uid, tid, fid)?.path.clone();
    let driver = disk_of(session, uid, tid)?;
    let info = driver
        .get_file_information(&path)
        .await
        .map_err(SmbStatus::from)?
        .ok_or(SmbStatus::DosInvalidHandle)?;

    let (create_date, create_time) = info.creation.to_smb_date_time();
    let (access_date, access_time) = info.access.to_smb_date_time();
    let (write_date, write_time) = info.write.to_smb_date_time();
    resp.begin_block(11);
    resp.set_param_u16(0, create_date);
    resp.set_param_u16(1, create_time);
    resp.set_param_u16(2, access_date);
    resp.set_param_u16(3, access_time);
    resp.set_param_u16(4, write_date);
    resp.set_param_u16(5, write_time);
    resp.set_param_u32(6, info.size as u32);
    resp.set_param_u32(8, info.allocation as u32);
    resp.set_param_u16(10, info.attributes as u16);
    resp.finish_block();
    Ok(Control::Reply)
}

/// SET_INFORMATION2: the FID-addressed date/time form.
pub async fn set_information2(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let path = find_open_file(session, uid, tid, fid)?.path.clone();

    let date_time = |date: u16, time: u16| {
        (date != 0 || time != 0).then(|| NtTime::from_smb_date_time(date, time))
    };
    let info = SetFileInfo {
        creation: date_time(req.param_u16(1), req.param_u16(2)),
        access: date_time(req.param_u16(3), req.param_u16(4)),
        write: date_time(req.param_u16(5), req.param_u16(6)),
        ..Default::default()
    };

    let driver = disk_of(session, uid, tid)?;
    if !info.is_empty() {
        driver.set_file_information(&path, &info).await.map_err(SmbStatus::from)?;
    }

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// QUERY_INFORMATION_DISK: 16-bit geometry, clamped the way DOS clients
/// expect.
pub async fn disk_information(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let driver = disk_of(session, uid, tid)?;
    let disk = match driver.sizing() {
        Some(sizing) => sizing.disk_size_information().await.map_err(SmbStatus::from)?,
        None => driver.disk_info(),
    };

    resp.begin_block(5);
    resp.set_param_u16(0, disk.total_units.min(0xFFFF) as u16);
    resp.set_param_u16(1, disk.blocks_per_unit.min(0xFFFF) as u16);
    resp.set_param_u16(2, disk.block_size.min(0xFFFF) as u16);
    resp.set_param_u16(3, disk.free_units.min(0xFFFF) as u16);
    resp.set_param_u16(4, 0);
    resp.finish_block();
    Ok(Control::Reply)
}
