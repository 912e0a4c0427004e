//! TRANS2 QUERY_FS_INFORMATION.

use num_traits::FromPrimitive;

use crate::info;
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, Control};
use crate::session::SmbSession;
use crate::smb1::FsInfoLevel;
use crate::status::SmbStatus;
use crate::transact::{write_trans2_response, TransactBuffer};
use crate::vfs::file::{NtTime, VolumeInfo};

pub async fn query_fs_info(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let level = FsInfoLevel::from_u16(pack::u16(&mut src)?).ok_or(SmbStatus::SrvNotSupported)?;
    let driver = disk_of(session, uid, tid)?;

    // Live sizing and volume identity come from the capability traits
    // when the driver carries them; static fallbacks otherwise.
    let disk = match driver.sizing() {
        Some(sizing) => sizing.disk_size_information().await.map_err(SmbStatus::from)?,
        None => driver.disk_info(),
    };
    let volume = match driver.volume() {
        Some(vol) => vol.volume_information().await.map_err(SmbStatus::from)?,
        None => VolumeInfo { label: String::new(), serial: 0, created: NtTime(0) },
    };

    // Streams-capable drivers present themselves as NTFS.
    let fs_name = if session.config.ntfs_streams && driver.streams().is_some() {
        "NTFS"
    } else {
        "FAT"
    };

    let data = info::pack_fs_info(level, &disk, &volume, fs_name, req.is_unicode())?;
    write_trans2_response(resp, &[], &data);
    Ok(Control::Reply)
}
