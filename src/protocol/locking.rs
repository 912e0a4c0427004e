//! LOCK, UNLOCK and LOCKING_ANDX, including oplock-break
//! acknowledgements.

use tracing::debug;

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file_mut, share_of, ChainState, Control};
use crate::session::SmbSession;
use crate::smb1::{self, lock_type};
use crate::status::SmbStatus;
use crate::vfs::ByteRange;

/// Legacy LOCK/UNLOCK: one 32-bit range, PID taken from the header.
pub async fn lock_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    lock: bool,
) -> Result<Control, SmbStatus> {
    let fid = req.param_u16(0);
    let length = req.param_u32(1) as u64;
    let offset = req.param_u32(3) as u64;
    let range = ByteRange { pid: req.pid() as u32, offset, length, shared: false };

    let (unlocks, locks): (Vec<ByteRange>, Vec<ByteRange>) =
        if lock { (vec![], vec![range]) } else { (vec![range], vec![]) };
    apply_ranges(session, uid, tid, fid, &unlocks, &locks).await?;

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// LOCKING_ANDX: unlock and lock arrays, 32- or 64-bit ranges, and the
/// oplock-break acknowledgement bits.
pub async fn locking_andx(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let fid = chain.resolve_fid(req.param_u16(2));
    let type_word = req.param_u16(3);
    let flags = type_word as u8;
    let _timeout = req.param_u32(4);
    let unlock_count = req.param_u16(6) as usize;
    let lock_count = req.param_u16(7) as usize;

    if flags & lock_type::OPLOCK_BREAK != 0 {
        let downgrade = flags & lock_type::SHARED != 0;
        let (path, had_oplock) = {
            let file = find_open_file_mut(session, uid, tid, fid)?;
            let had = file.oplock.take().is_some();
            if downgrade {
                file.oplock = Some(crate::oplock::OplockType::LevelII);
            }
            (file.path.clone(), had)
        };
        if had_oplock {
            let share = share_of(session, uid, tid)?;
            debug!(%path, fid, downgrade, "oplock break acknowledged");
            share.oplocks.acknowledge(&path, session.id, fid, downgrade);
        }
        // A pure acknowledgement gets no response of its own.
        if unlock_count == 0 && lock_count == 0 {
            return Ok(Control::NoReply);
        }
    }

    let large = flags & lock_type::LARGE_FILES != 0;
    let shared = flags & lock_type::SHARED != 0;
    let mut src = req.bytes_reader();
    let mut unlocks = Vec::with_capacity(unlock_count);
    for _ in 0..unlock_count {
        unlocks.push(read_range(&mut src, large, shared)?);
    }
    let mut locks = Vec::with_capacity(lock_count);
    for _ in 0..lock_count {
        locks.push(read_range(&mut src, large, shared)?);
    }

    apply_ranges(session, uid, tid, fid, &unlocks, &locks).await?;

    resp.begin_block(2);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.finish_block();
    Ok(Control::Reply)
}

fn read_range(
    src: &mut impl std::io::Read,
    large: bool,
    shared: bool,
) -> Result<ByteRange, SmbStatus> {
    if large {
        let pid = pack::u16(src)? as u32;
        let _pad = pack::u16(src)?;
        let offset_high = pack::u32(src)? as u64;
        let offset_low = pack::u32(src)? as u64;
        let len_high = pack::u32(src)? as u64;
        let len_low = pack::u32(src)? as u64;
        Ok(ByteRange {
            pid,
            offset: offset_high << 32 | offset_low,
            length: len_high << 32 | len_low,
            shared,
        })
    } else {
        let pid = pack::u16(src)? as u32;
        let offset = pack::u32(src)? as u64;
        let length = pack::u32(src)? as u64;
        Ok(ByteRange { pid, offset, length, shared })
    }
}

/// Applies unlocks then locks, in array order, through the driver's lock
/// manager. Without one, unlocks fail as not-locked and locks succeed
/// vacuously.
async fn apply_ranges(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    fid: u16,
    unlocks: &[ByteRange],
    locks: &[ByteRange],
) -> Result<(), SmbStatus> {
    let driver = disk_of(session, uid, tid)?;
    let handle = {
        let file = find_open_file_mut(session, uid, tid, fid)?;
        file.driver_file
    };

    let manager = driver.lock_manager();
    for range in unlocks {
        match &manager {
            Some(manager) => manager.unlock_file(handle, *range).map_err(SmbStatus::from)?,
            None => return Err(SmbStatus::NTRangeNotLocked),
        }
        let file = find_open_file_mut(session, uid, tid, fid)?;
        file.locks.retain(|held| !(held.offset == range.offset && held.length == range.length));
    }
    for range in locks {
        if let Some(manager) = &manager {
            manager.lock_file(handle, *range).map_err(SmbStatus::from)?;
        }
        let file = find_open_file_mut(session, uid, tid, fid)?;
        file.locks.push(*range);
    }
    Ok(())
}
