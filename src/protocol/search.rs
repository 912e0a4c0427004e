//! Legacy SEARCH (SMB_COM_SEARCH) and FIND_CLOSE2.
//!
//! SEARCH predates the transaction-based finds: fixed 43-byte entries,
//! uppercase 8.3 names, and an opaque resume key the client echoes back
//! verbatim to continue or restart an enumeration.

use tracing::debug;

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, Control};
use crate::search::{self, PseudoState, ResumeKey, SearchContext};
use crate::session::SmbSession;
use crate::smb1::{attr, nt_attr, resume_id};
use crate::status::SmbStatus;
use crate::vfs::file::FileInfo;

/// Bytes of one packed directory-information entry.
const SEARCH_INFO_LEN: usize = 43;

pub async fn search_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let max_files = req.param_u16(0);
    let attributes = req.param_u16(1);

    let (pattern, next) = super::read_legacy_path(req, 0)?;
    // Resume block: 0x05 marker + 16-bit length + key bytes.
    let bytes = req.bytes();
    if bytes.get(next) != Some(&0x05) || next + 3 > bytes.len() {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let resume_len = pack::get_u16(bytes, next + 1) as usize;
    let resume_block = &bytes[next + 3..];
    if resume_block.len() < resume_len {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }

    let read_only_share = {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
        tree.is_read_only()
    };
    let driver = disk_of(session, uid, tid)?;

    let slot = if resume_len == 0 && !pattern.is_empty() {
        // Fresh search.
        let normalized = search::normalize_wildcards(&pattern);
        let cursor =
            driver.start_search(&normalized, attributes).await.map_err(SmbStatus::from)?;
        let ctx = SearchContext::new(tid, normalized, attributes, max_files, cursor);
        let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        vc.searches.allocate(ctx).ok_or(SmbStatus::SrvNoResourcesAvailable)?
    } else {
        // Resumption: decode and validate the echoed key.
        let key = ResumeKey::from_bytes(&resume_block[..resume_len.min(resume_block.len())])
            .ok_or(SmbStatus::SrvUnrecognizedCommand)?;
        let slot = key.slot as usize;
        let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let ctx = vc.searches.get_mut(slot).ok_or(SmbStatus::DosInvalidHandle)?;
        if ctx.tid != tid {
            return Err(SmbStatus::DosInvalidHandle);
        }
        position_after(ctx, key.entry_id);
        slot
    };

    // The parent directory's metadata backs the synthetic entries.
    let parent_info = {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let ctx = vc.searches.get(slot).ok_or(SmbStatus::DosInvalidHandle)?;
        if ctx.pseudo != PseudoState::Done {
            let dir = ctx.pattern.rsplit_once('\\').map(|(d, _)| d).unwrap_or("");
            let dir = if dir.is_empty() { "\\" } else { dir };
            driver.get_file_information(dir).await.ok().flatten()
        } else {
            None
        }
    };

    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let ctx = vc.searches.get_mut(slot).ok_or(SmbStatus::DosInvalidHandle)?;

    // An empty directory produces no pseudo entries: probe before the
    // first "." would go out.
    if ctx.pseudo == PseudoState::Start {
        match ctx.cursor.next_entry() {
            Some(_) => {
                let id = ctx.cursor.resume_id();
                ctx.cursor.restart_at(id);
            }
            None => {
                vc.searches.free(slot);
                return Err(SmbStatus::DosNoMoreFiles);
            }
        }
    }

    let wildcard = ctx.is_wildcard();
    let mut entries = Vec::new();
    let mut count = 0u16;
    while count < max_files {
        let Some((info, entry_id)) = next_search_entry(ctx, parent_info.as_ref()) else {
            break;
        };
        pack_search_entry(&mut entries, ctx, slot as u16, entry_id, &info, read_only_share);
        count += 1;
    }

    if count == 0 {
        // Exhausted: the slot dies with the final error response.
        vc.searches.free(slot);
        return Err(SmbStatus::DosNoMoreFiles);
    }
    if !wildcard && count == 1 {
        // A single-file lookup never continues; reclaim eagerly.
        vc.searches.free(slot);
    }
    debug!(slot, count, "search");

    resp.begin_block(1);
    resp.set_param_u16(0, count);
    pack::put_u8(resp.data(), 0x05);
    pack::put_u16(resp.data(), entries.len() as u16);
    pack::put_bytes(resp.data(), &entries);
    resp.finish_block();
    Ok(Control::Reply)
}

/// FIND_CLOSE2: frees a transaction-find search slot.
pub async fn find_close2(
    session: &mut SmbSession,
    uid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let sid = req.param_u16(0) as usize;
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    vc.searches.free(sid).ok_or(SmbStatus::NTInvalidHandle)?;
    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Repositions a resumed search just past the entry the key names.
fn position_after(ctx: &mut SearchContext, entry_id: u16) {
    match entry_id {
        resume_id::START => {
            ctx.pseudo =
                if ctx.is_wildcard() { PseudoState::Start } else { PseudoState::Done };
        }
        resume_id::DOT => ctx.pseudo = PseudoState::DotReturned,
        resume_id::DOT_DOT => ctx.pseudo = PseudoState::Done,
        id => {
            ctx.pseudo = PseudoState::Done;
            ctx.cursor.restart_at(id as u32);
            ctx.cursor.next_entry();
        }
    }
}

/// The next entry: pseudo pair first on wildcard searches, then driver
/// entries with hidden dot-names skipped.
fn next_search_entry(
    ctx: &mut SearchContext,
    parent_info: Option<&FileInfo>,
) -> Option<(FileInfo, u16)> {
    match ctx.pseudo {
        PseudoState::Start => {
            ctx.pseudo = PseudoState::DotReturned;
            let mut info = parent_info.cloned().unwrap_or_default();
            info.file_name = ".".to_string();
            info.attributes |= nt_attr::DIRECTORY;
            Some((info, resume_id::DOT))
        }
        PseudoState::DotReturned => {
            ctx.pseudo = PseudoState::Done;
            let mut info = parent_info.cloned().unwrap_or_default();
            info.file_name = "..".to_string();
            info.attributes |= nt_attr::DIRECTORY;
            Some((info, resume_id::DOT_DOT))
        }
        PseudoState::Done => loop {
            let info = ctx.cursor.next_entry()?;
            // Dot-prefixed names never appear in legacy listings; the
            // synthetic pair above is the only exception.
            if info.file_name.starts_with('.') {
                continue;
            }
            return Some((info, ctx.cursor.resume_id() as u16));
        },
    }
}

/// Packs one 43-byte directory-information entry: 21-byte resume key,
/// attribute byte, SMB time and date, 32-bit size, 13-byte 8.3 name.
fn pack_search_entry(
    out: &mut Vec<u8>,
    ctx: &SearchContext,
    slot: u16,
    entry_id: u16,
    info: &FileInfo,
    read_only_share: bool,
) {
    let key = ResumeKey {
        pattern: search::pattern_to_83(&ctx.pattern_tail),
        slot,
        entry_id,
    };
    pack::put_bytes(out, &key.to_bytes());

    let mut attributes = info.dos_attributes() & attr::STANDARD_MASK as u8;
    if read_only_share {
        attributes |= attr::READ_ONLY as u8;
    }
    pack::put_u8(out, attributes);

    let (date, time) = info.write.to_smb_date_time();
    pack::put_u16(out, time);
    pack::put_u16(out, date);
    pack::put_u32(out, info.size as u32);

    // Uppercase 8.3 name, null-padded to 13 with at most 12 characters.
    let name = search::dos_name(&info.file_name);
    let mut field = [0u8; 13];
    for (i, c) in name.bytes().take(12).enumerate() {
        field[i] = c;
    }
    pack::put_bytes(out, &field);

    debug_assert_eq!(out.len() % SEARCH_INFO_LEN, 0);
}
