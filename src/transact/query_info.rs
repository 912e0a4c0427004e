//! TRANS2 QUERY_PATH_INFORMATION / QUERY_FILE_INFORMATION.

use num_traits::FromPrimitive;

use crate::info;
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, Control};
use crate::session::SmbSession;
use crate::smb1::{QueryInfoLevel, DATA_STREAM_MARKER};
use crate::status::SmbStatus;
use crate::transact::{write_trans2_response, TransactBuffer};

/// Strips the explicit unnamed-data-stream suffix a client may append.
pub fn normalize_stream_path(path: &str) -> &str {
    path.strip_suffix(DATA_STREAM_MARKER)
        .map(|p| p.strip_suffix(':').unwrap_or(p))
        .unwrap_or(path)
}

pub async fn query_path(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let level = QueryInfoLevel::from_u16(pack::u16(&mut src)?).ok_or(SmbStatus::SrvNotSupported)?;
    let _reserved = pack::u32(&mut src)?;
    let path = if req.is_unicode() {
        pack::string_unicode(&mut src, crate::vfs::MAX_PATH_LEN)?
    } else {
        pack::string_ascii(&mut src, crate::vfs::MAX_PATH_LEN)?
    };
    query_common(session, uid, tid, level, &path, req, resp).await
}

pub async fn query_file(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let fid = pack::u16(&mut src)?;
    let level = QueryInfoLevel::from_u16(pack::u16(&mut src)?).ok_or(SmbStatus::SrvNotSupported)?;
    let path = find_open_file(session, uid, tid, fid)?.path.clone();
    query_common(session, uid, tid, level, &path, req, resp).await
}

async fn query_common(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    level: QueryInfoLevel,
    path: &str,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let driver = disk_of(session, uid, tid)?;
    let path = normalize_stream_path(path);

    let data = if level == QueryInfoLevel::Stream {
        let streams = match driver.streams() {
            Some(iface) if session.config.ntfs_streams => {
                iface.stream_list(path).await.map_err(SmbStatus::from)?
            }
            _ => return Err(SmbStatus::SrvNotSupported),
        };
        let file = driver
            .get_file_information(path)
            .await
            .map_err(SmbStatus::from)?
            .ok_or(SmbStatus::NTObjectNotFound)?;
        info::pack_stream_list(file.size, file.allocation, &streams)
    } else {
        let file = driver
            .get_file_information(path)
            .await
            .map_err(SmbStatus::from)?
            .ok_or(SmbStatus::NTObjectNotFound)?;
        info::pack_query_info(level, &file, req.is_unicode())?
    };

    write_trans2_response(resp, &[0, 0], &data);
    Ok(Control::Reply)
}
