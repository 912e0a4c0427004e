//! TRANS2 FIND_FIRST2 / FIND_NEXT2: variable-layout directory search.

use num_traits::FromPrimitive;
use tracing::debug;

use crate::info;
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, Control};
use crate::search::{self, SearchContext};
use crate::session::SmbSession;
use crate::smb1::{find_flags, FindInfoLevel};
use crate::status::SmbStatus;
use crate::transact::{write_trans2_response, TransactBuffer};
use crate::vfs::file::FileInfo;

struct FindFirstArgs {
    attributes: u16,
    max_files: u16,
    flags: u16,
    level: FindInfoLevel,
    pattern: String,
}

fn parse_find_first(buffer: &TransactBuffer, unicode: bool) -> Result<FindFirstArgs, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let attributes = pack::u16(&mut src)?;
    let max_files = pack::u16(&mut src)?;
    let flags = pack::u16(&mut src)?;
    let level_code = pack::u16(&mut src)?;
    let _storage_type = pack::u32(&mut src)?;
    let name = if unicode {
        pack::string_unicode(&mut src, crate::vfs::MAX_PATH_LEN)?
    } else {
        pack::string_ascii(&mut src, crate::vfs::MAX_PATH_LEN)?
    };
    let level = FindInfoLevel::from_u16(level_code).ok_or(SmbStatus::SrvNotSupported)?;
    Ok(FindFirstArgs { attributes, max_files, flags, level, pattern: normalize_pattern(&name) })
}

/// Normalizes a client search path: Unicode wildcards become DOS
/// wildcards, a missing leading `\` is prefixed, a trailing `\` expands
/// to `\*.*`.
fn normalize_pattern(name: &str) -> String {
    let mut pattern = search::normalize_wildcards(name);
    if !pattern.starts_with('\\') {
        pattern.insert(0, '\\');
    }
    if pattern.ends_with('\\') {
        pattern.push_str("*.*");
    }
    pattern
}

/// `true` when the pattern tail matches every name, which is what gates
/// the pseudo "." and ".." entries.
fn is_match_all(pattern: &str) -> bool {
    let tail = pattern.rsplit('\\').next().unwrap_or(pattern);
    matches!(tail, "*" | "*.*" | "????????.???")
}

pub async fn find_first2(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let unicode = req.is_unicode();
    let args = parse_find_first(buffer, unicode)?;
    let driver = disk_of(session, uid, tid)?;

    let cursor = driver.start_search(&args.pattern, args.attributes).await.map_err(SmbStatus::from)?;

    // Pseudo entries borrow the parent directory's metadata.
    let parent_info = if is_match_all(&args.pattern) {
        let dir = args.pattern.rsplit_once('\\').map(|(d, _)| d).unwrap_or("");
        let dir = if dir.is_empty() { "\\" } else { dir };
        driver.get_file_information(dir).await.ok().flatten()
    } else {
        None
    };

    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let mut ctx = SearchContext::new(
        tid,
        args.pattern.clone(),
        args.attributes,
        args.max_files,
        cursor,
    );
    if parent_info.is_none() {
        ctx.pseudo = search::PseudoState::Done;
    }

    let mut data = Vec::new();
    let (count, eof, last_offset) = pack_entries(
        &mut ctx,
        &mut data,
        args.level,
        args.max_files,
        args.flags & find_flags::RETURN_RESUME_KEY != 0,
        unicode,
        buffer.max_data_return,
        parent_info.as_ref(),
    );

    let close_now = args.flags & find_flags::CLOSE_SEARCH != 0
        || (eof && args.flags & find_flags::CLOSE_AT_END != 0);
    let sid = if close_now || eof {
        0
    } else {
        let slot = vc.searches.allocate(ctx).ok_or(SmbStatus::SrvNoResourcesAvailable)?;
        slot as u16
    };
    debug!(pattern = %args.pattern, count, eof, sid, "find first");

    let mut params = Vec::new();
    pack::put_u16(&mut params, sid);
    pack::put_u16(&mut params, count);
    pack::put_u16(&mut params, u16::from(eof));
    pack::put_u16(&mut params, 0); // EA error offset
    pack::put_u16(&mut params, last_offset as u16);
    write_trans2_response(resp, &params, &data);
    Ok(Control::Reply)
}

pub async fn find_next2(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let unicode = req.is_unicode();
    let mut src = std::io::Cursor::new(buffer.params());
    let sid = pack::u16(&mut src)? as usize;
    let max_files = pack::u16(&mut src)?;
    let level_code = pack::u16(&mut src)?;
    let resume_key = pack::u32(&mut src)?;
    let flags = pack::u16(&mut src)?;
    let level = FindInfoLevel::from_u16(level_code).ok_or(SmbStatus::SrvNotSupported)?;

    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let ctx = vc.searches.get_mut(sid).ok_or(SmbStatus::NTInvalidHandle)?;
    if ctx.tid != tid {
        return Err(SmbStatus::NTInvalidHandle);
    }

    if flags & find_flags::CONTINUE_FROM_LAST == 0 && resume_key != 0 {
        // Resume after the named entry rather than the cursor position.
        ctx.cursor.restart_at(resume_key);
        ctx.cursor.next_entry();
    }

    let mut data = Vec::new();
    let (count, eof, last_offset) = pack_entries(
        ctx,
        &mut data,
        level,
        max_files,
        flags & find_flags::RETURN_RESUME_KEY != 0,
        unicode,
        buffer.max_data_return,
        None,
    );

    if flags & find_flags::CLOSE_SEARCH != 0 || (eof && flags & find_flags::CLOSE_AT_END != 0) {
        vc.searches.free(sid);
    }

    let mut params = Vec::new();
    pack::put_u16(&mut params, count);
    pack::put_u16(&mut params, u16::from(eof));
    pack::put_u16(&mut params, 0);
    pack::put_u16(&mut params, last_offset as u16);
    write_trans2_response(resp, &params, &data);
    Ok(Control::Reply)
}

/// Packs entries until the count cap, the byte limit, or exhaustion.
/// Returns `(count, end_of_search, last_entry_offset)`. An entry that
/// does not fit is pushed back — the cursor rewound, or the pseudo-entry
/// state restored — so the next FIND_NEXT resumes with it.
#[allow(clippy::too_many_arguments)]
fn pack_entries(
    ctx: &mut SearchContext,
    data: &mut Vec<u8>,
    level: FindInfoLevel,
    max_files: u16,
    resume_keys: bool,
    unicode: bool,
    byte_limit: usize,
    parent_info: Option<&FileInfo>,
) -> (u16, bool, usize) {
    // Resume keys are only honored at the standard info level.
    let resume_keys = resume_keys && !info::find_level_is_chained(level);
    let max_files = if max_files == 0 { u16::MAX } else { max_files };
    let mut count = 0u16;
    let mut eof = false;
    let mut last_offset = 0usize;
    let mut prev_record: Option<usize> = None;

    while count < max_files {
        let pseudo_before = ctx.pseudo;
        let (entry, resume_id) = match next_entry(ctx, parent_info) {
            Some(pair) => pair,
            None => {
                eof = true;
                break;
            }
        };
        match info::pack_find_entry(data, level, &entry, resume_id, resume_keys, unicode, byte_limit)
        {
            Some(start) => {
                if let Some(prev) = prev_record {
                    if info::find_level_is_chained(level) {
                        info::set_next_entry_offset(data, prev, start);
                    }
                }
                prev_record = Some(start);
                last_offset = start;
                count += 1;
            }
            None => {
                // Out of space: rewind so this entry leads the next
                // batch. Driver entries roll the cursor back; a pseudo
                // entry rolls its state machine back instead.
                if pseudo_before == search::PseudoState::Done {
                    ctx.cursor.restart_at(resume_id);
                } else {
                    ctx.pseudo = pseudo_before;
                }
                break;
            }
        }
    }
    (count, eof, last_offset)
}

/// The next entry of a search: the synthetic "." and ".." pair first for
/// match-all wildcard patterns, then the driver's listing.
fn next_entry(
    ctx: &mut SearchContext,
    parent_info: Option<&FileInfo>,
) -> Option<(FileInfo, u32)> {
    match ctx.pseudo {
        search::PseudoState::Start => {
            ctx.pseudo = search::PseudoState::DotReturned;
            Some((pseudo_entry(".", parent_info), 0))
        }
        search::PseudoState::DotReturned => {
            ctx.pseudo = search::PseudoState::Done;
            Some((pseudo_entry("..", parent_info), 0))
        }
        search::PseudoState::Done => {
            let entry = ctx.cursor.next_entry()?;
            let id = ctx.cursor.resume_id();
            Some((entry, id))
        }
    }
}

fn pseudo_entry(name: &str, parent_info: Option<&FileInfo>) -> FileInfo {
    let mut entry = parent_info.cloned().unwrap_or_default();
    entry.file_name = name.to_string();
    entry.attributes |= crate::smb1::nt_attr::DIRECTORY;
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::search::SearchCursor;

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("dir\\a.txt"), "\\dir\\a.txt");
        assert_eq!(normalize_pattern("\\dir\\"), "\\dir\\*.*");
        assert_eq!(normalize_pattern("\\d\\<.>"), "\\d\\*.?");
    }

    #[test]
    fn test_is_match_all() {
        assert!(is_match_all("\\dir\\*.*"));
        assert!(is_match_all("\\dir\\*"));
        assert!(is_match_all("\\dir\\????????.???"));
        assert!(!is_match_all("\\dir\\a*.txt"));
    }

    struct StubCursor;

    impl SearchCursor for StubCursor {
        fn next_entry(&mut self) -> Option<FileInfo> {
            None
        }
        fn restart_at(&mut self, _resume_id: u32) {}
        fn resume_id(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_pack_entries_requeues_overflowing_pseudo_entry() {
        let mut ctx = SearchContext::new(
            1,
            "\\d\\*.*".to_string(),
            0x16,
            10,
            Box::new(StubCursor),
        );
        assert_eq!(ctx.pseudo, search::PseudoState::Start);
        let parent = FileInfo { file_name: "d".to_string(), ..Default::default() };

        // No room for even one record: "." must not be consumed.
        let mut data = Vec::new();
        let (count, eof, _) = pack_entries(
            &mut ctx,
            &mut data,
            FindInfoLevel::Directory,
            10,
            false,
            true,
            8,
            Some(&parent),
        );
        assert_eq!(count, 0);
        assert!(!eof);
        assert_eq!(ctx.pseudo, search::PseudoState::Start);

        // A roomier retry leads with the "." it rolled back.
        let mut data = Vec::new();
        let (count, _, _) = pack_entries(
            &mut ctx,
            &mut data,
            FindInfoLevel::Directory,
            1,
            false,
            true,
            4096,
            Some(&parent),
        );
        assert_eq!(count, 1);
        assert_eq!(crate::pack::get_u32(&data, 60), 2); // name length
        assert_eq!(crate::pack::get_u16(&data, 64), b'.' as u16);
        assert_eq!(ctx.pseudo, search::PseudoState::DotReturned);
    }
}
