//! READ(+AndX), WRITE(+AndX), WRITE_AND_CLOSE, SEEK and FLUSH.

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, find_open_file_mut, open, ChainState, Control};
use crate::session::{PostAction, SmbSession};
use crate::smb1;
use crate::status::SmbStatus;
use crate::vfs::SeekMode;

/// Legacy READ: 16-bit count, 32-bit offset.
pub async fn read_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let count = req.param_u16(1) as u32;
    let offset = req.param_u32(2) as u64;

    let driver = disk_of(session, uid, tid)?;
    let handle = find_open_file(session, uid, tid, fid)?.driver_file;
    let data = driver.read_file(handle, offset, count).await.map_err(SmbStatus::from)?;

    resp.begin_block(5);
    resp.set_param_u16(0, data.len() as u16);
    // Data block: 0x01 marker + 16-bit length + bytes.
    pack::put_u8(resp.data(), 0x01);
    pack::put_u16(resp.data(), data.len() as u16);
    pack::put_bytes(resp.data(), &data);
    resp.finish_block();
    Ok(Control::Reply)
}

/// READ_ANDX: large offsets with the optional high-offset words.
pub async fn read_andx(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let fid = chain.resolve_fid(req.param_u16(2));
    let mut offset = req.param_u32(3) as u64;
    let max_count = req.param_u16(5) as u32;
    if req.word_count() >= 12 {
        offset |= (req.param_u32(10) as u64) << 32;
    }

    let driver = disk_of(session, uid, tid)?;
    let handle = find_open_file(session, uid, tid, fid)?.driver_file;
    let data = driver.read_file(handle, offset, max_count).await.map_err(SmbStatus::from)?;

    resp.begin_block(12);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.set_param_u16(2, 0xFFFF); // available (pipes only)
    resp.set_param_u16(3, 0); // data compaction mode
    resp.set_param_u16(4, 0);
    resp.set_param_u16(5, data.len() as u16);
    // The byte block begins right after the byte-count field; one pad
    // byte puts the data on a word boundary.
    let data_offset = resp.len() + 1;
    resp.set_param_u16(6, data_offset as u16);
    pack::put_u8(resp.data(), 0); // pad for word alignment
    pack::put_bytes(resp.data(), &data);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Legacy WRITE: data block with marker and 16-bit length.
pub async fn write_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let count = req.param_u16(1) as usize;
    let offset = req.param_u32(2) as u64;

    let mut src = req.bytes_reader();
    if pack::u8(&mut src)? != 0x01 {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let declared = pack::u16(&mut src)? as usize;
    let data = pack::bytes(&mut src, declared.min(count))?;

    let written = write_through(session, uid, tid, fid, offset, &data).await?;

    // A zero-length write truncates at the offset.
    if data.is_empty() {
        let driver = disk_of(session, uid, tid)?;
        let handle = find_open_file(session, uid, tid, fid)?.driver_file;
        driver.truncate_file(handle, offset).await.map_err(SmbStatus::from)?;
    }

    resp.begin_block(1);
    resp.set_param_u16(0, written as u16);
    resp.finish_block();
    Ok(Control::Reply)
}

/// WRITE_ANDX.
pub async fn write_andx(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let fid = chain.resolve_fid(req.param_u16(2));
    let mut offset = req.param_u32(3) as u64;
    let data_len = req.param_u16(10) as usize;
    let data_offset = req.param_u16(11) as usize;
    if req.word_count() >= 14 {
        offset |= (req.param_u32(12) as u64) << 32;
    }

    let raw = req.as_slice();
    let end = data_offset.checked_add(data_len).ok_or(SmbStatus::NTInvalidParameter)?;
    if data_offset < smb1::HEADER_LEN || end > raw.len() {
        return Err(SmbStatus::NTInvalidParameter);
    }
    let data = raw[data_offset..end].to_vec();

    let written = write_through(session, uid, tid, fid, offset, &data).await?;

    resp.begin_block(6);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.set_param_u16(2, written as u16);
    resp.set_param_u16(3, 0xFFFF); // remaining
    resp.set_param_u32(4, 0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// WRITE_AND_CLOSE: one write, then the full close path.
pub async fn write_and_close(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let count = req.param_u16(1) as usize;
    let offset = req.param_u32(2) as u64;

    // One pad byte precedes the data so it lands word-aligned.
    let bytes = req.bytes();
    if bytes.len() < 1 + count {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let data = bytes[1..1 + count].to_vec();

    let written = write_through(session, uid, tid, fid, offset, &data).await?;
    open::close_fid(session, uid, tid, fid).await?;

    resp.begin_block(1);
    resp.set_param_u16(0, written as u16);
    resp.finish_block();
    Ok(Control::Reply)
}

/// SEEK.
pub async fn seek(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let mode = match req.param_u16(1) & 0x0003 {
        0 => SeekMode::Start,
        1 => SeekMode::Current,
        _ => SeekMode::End,
    };
    let offset = req.param_u32(2) as i32 as i64;

    let driver = disk_of(session, uid, tid)?;
    let handle = find_open_file(session, uid, tid, fid)?.driver_file;
    let position = driver.seek_file(handle, offset, mode).await.map_err(SmbStatus::from)?;

    resp.begin_block(2);
    resp.set_param_u32(0, position as u32);
    resp.finish_block();
    Ok(Control::Reply)
}

/// FLUSH: one file, or every file on the tree for FID `0xFFFF`.
pub async fn flush(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let driver = disk_of(session, uid, tid)?;

    if fid == 0xFFFF {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
        let handles: Vec<_> = tree.fids().iter().filter_map(|&f| tree.find_file(f)).map(|f| f.driver_file).collect();
        for handle in handles {
            driver.flush_file(handle).await.map_err(SmbStatus::from)?;
        }
    } else {
        let handle = find_open_file(session, uid, tid, fid)?.driver_file;
        driver.flush_file(handle).await.map_err(SmbStatus::from)?;
    }

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// The shared write path: driver call, write accounting, and a queued
/// flush finalizer drained after the response goes out.
async fn write_through(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    fid: u16,
    offset: u64,
    data: &[u8],
) -> Result<u32, SmbStatus> {
    let driver = disk_of(session, uid, tid)?;
    let handle = find_open_file(session, uid, tid, fid)?.driver_file;
    let written = driver.write_file(handle, offset, data).await.map_err(SmbStatus::from)?;

    let file = find_open_file_mut(session, uid, tid, fid)?;
    file.record_write();
    session.push_post_action(PostAction::Flush { uid, tid, fid });
    Ok(written)
}
