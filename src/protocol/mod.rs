//! Command dispatch.
//!
//! Every parsed frame lands in [`process_request`]: the command byte is
//! looked up in the fixed table, the block's shape is validated, the
//! virtual circuit, tree and permission checks run in order, and the
//! handler is invoked. AndX chains walk the embedded next-command slots,
//! appending each chained block to the same response and patching the
//! previous block's offset slot. Opens contending with an oplock return a
//! deferral instead of a response; the packet moves into the oplock
//! registry and is replayed here after the break resolves.

pub mod attr;
pub mod io;
pub mod locking;
pub mod misc;
pub mod open;
pub mod path_ops;
pub mod search;
pub mod session_setup;
pub mod tree;

use std::sync::Arc;

use num_traits::FromPrimitive;
use tracing::{debug, warn};

use crate::oplock::{BreakOutcome, OplockRegistry};
use crate::packet::SmbPacket;
use crate::session::file::OpenFile;
use crate::session::tree::SharedDevice;
use crate::session::SmbSession;
use crate::smb1::{self, Command};
use crate::status::SmbStatus;
use crate::transact;
use crate::vfs::DiskInterface;

/// What a handler tells the dispatcher to do with the response.
pub enum Control {
    /// Send the response that was built.
    Reply,
    /// Send nothing (notify subscriptions, incomplete reassembly).
    NoReply,
    /// The open must wait for an oplock break on `path`; park the packet.
    DeferOpen { path: String, oplocks: Arc<OplockRegistry> },
}

/// What the engine does after dispatch.
pub enum Outcome {
    Reply(SmbPacket),
    NoReply,
    /// Packet ownership moved to the oplock registry.
    Deferred,
    /// Command byte not in the table; the caller logs and carries on.
    Unknown,
}

/// State threaded along an AndX chain: identities established by earlier
/// links and the open file shared between them.
#[derive(Default)]
pub struct ChainState {
    /// UID assigned by a chained session setup.
    pub uid: Option<u16>,
    /// TID assigned by a chained tree connect.
    pub tid: Option<u16>,
    /// FID produced by a chained open, consumed by `0xFFFF` FID fields.
    pub last_fid: Option<u16>,
    /// The oplock registry already resolved this packet's break (the
    /// owner was the opener itself, or the break completed); open
    /// handlers must not defer again.
    pub oplock_checked: bool,
}

impl ChainState {
    /// Resolves a request FID, honoring the chained-open sentinel.
    pub fn resolve_fid(&self, fid: u16) -> u16 {
        if fid == 0xFFFF {
            self.last_fid.unwrap_or(fid)
        } else {
            fid
        }
    }
}

/// Identity and permission requirements checked before a handler runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Requires {
    Nothing,
    Circuit,
    Tree,
    ReadAccess,
    WriteAccess,
}

/// Parameter-word shape of a command block.
#[derive(Debug, Copy, Clone)]
enum Shape {
    Exact(u8),
    Min(u8),
}

/// The command table: expected shape, minimum byte count, and the checks
/// that gate the handler.
fn command_table(cmd: Command) -> (Shape, u16, Requires) {
    use Command::*;
    match cmd {
        Negotiate => (Shape::Exact(0), 2, Requires::Nothing),
        SessionSetupAndX => (Shape::Min(10), 0, Requires::Nothing),
        LogoffAndX => (Shape::Exact(2), 0, Requires::Circuit),
        TreeConnect => (Shape::Exact(0), 4, Requires::Circuit),
        TreeConnectAndX => (Shape::Exact(4), 3, Requires::Circuit),
        TreeDisconnect => (Shape::Exact(0), 0, Requires::Tree),
        Echo => (Shape::Exact(1), 0, Requires::Nothing),
        ProcessExit => (Shape::Exact(0), 0, Requires::Circuit),
        NTCancel => (Shape::Exact(0), 0, Requires::Tree),
        CreateDirectory => (Shape::Exact(0), 2, Requires::WriteAccess),
        DeleteDirectory => (Shape::Exact(0), 2, Requires::WriteAccess),
        CheckDirectory => (Shape::Exact(0), 2, Requires::ReadAccess),
        OpenFile => (Shape::Exact(2), 2, Requires::ReadAccess),
        CreateFile => (Shape::Exact(3), 2, Requires::WriteAccess),
        OpenAndX => (Shape::Exact(15), 1, Requires::ReadAccess),
        NTCreateAndX => (Shape::Exact(24), 1, Requires::ReadAccess),
        CloseFile => (Shape::Exact(3), 0, Requires::Tree),
        FlushFile => (Shape::Exact(1), 0, Requires::ReadAccess),
        ReadFile => (Shape::Exact(5), 0, Requires::ReadAccess),
        WriteFile => (Shape::Exact(5), 3, Requires::WriteAccess),
        WriteAndClose => (Shape::Min(6), 1, Requires::WriteAccess),
        ReadAndX => (Shape::Min(10), 0, Requires::ReadAccess),
        WriteAndX => (Shape::Min(12), 0, Requires::WriteAccess),
        SeekFile => (Shape::Exact(4), 0, Requires::ReadAccess),
        LockFile => (Shape::Exact(5), 0, Requires::ReadAccess),
        UnLockFile => (Shape::Exact(5), 0, Requires::ReadAccess),
        LockingAndX => (Shape::Min(8), 0, Requires::ReadAccess),
        DeleteFile => (Shape::Exact(1), 2, Requires::WriteAccess),
        RenameFile => (Shape::Exact(1), 4, Requires::WriteAccess),
        GetFileAttributes => (Shape::Exact(0), 2, Requires::ReadAccess),
        SetFileAttributes => (Shape::Exact(8), 2, Requires::WriteAccess),
        QueryInformation2 => (Shape::Exact(1), 0, Requires::ReadAccess),
        SetInformation2 => (Shape::Exact(7), 0, Requires::WriteAccess),
        DiskInformation => (Shape::Exact(0), 0, Requires::ReadAccess),
        Search => (Shape::Exact(2), 5, Requires::ReadAccess),
        FindClose2 => (Shape::Exact(1), 0, Requires::Tree),
        Transaction => (Shape::Min(14), 0, Requires::ReadAccess),
        TransactionSecond => (Shape::Exact(8), 0, Requires::ReadAccess),
        Transaction2 => (Shape::Min(14), 0, Requires::ReadAccess),
        Transaction2Second => (Shape::Exact(9), 0, Requires::ReadAccess),
        NTTransact => (Shape::Min(19), 0, Requires::ReadAccess),
        NTTransactSecond => (Shape::Exact(18), 0, Requires::ReadAccess),
        // Present in the table, refused by the handler.
        Find | FindUnique | IOCtl | LockAndRead | WriteAndUnlock | ReadRaw | WriteRaw => {
            (Shape::Min(0), 0, Requires::Tree)
        }
    }
}

/// Processes one request frame end to end, replaying internally when an
/// oplock break resolves in the opener's favor synchronously.
pub async fn process_request(session: &mut SmbSession, mut packet: SmbPacket) -> Outcome {
    let mut oplock_checked = false;
    loop {
        // Replayed packets come back with their block offset mid-chain.
        if packet.seek_block(smb1::HEADER_LEN).is_err() {
            return Outcome::Unknown;
        }
        let Some(cmd) = Command::from_u8(packet.command_byte()) else {
            warn!(command = packet.command_byte(), "unknown command");
            return Outcome::Unknown;
        };

        let mut chain = ChainState { oplock_checked, ..Default::default() };
        let mut resp = SmbPacket::response_to(&packet);
        match dispatch_chain(session, cmd, &mut packet, &mut resp, &mut chain).await {
            Ok(Control::Reply) => return Outcome::Reply(resp),
            Ok(Control::NoReply) => return Outcome::NoReply,
            Ok(Control::DeferOpen { path, oplocks }) => {
                let pid = packet.pid();
                match oplocks.request_break(
                    &path,
                    session.id,
                    pid,
                    packet,
                    session.requeue.clone(),
                ) {
                    BreakOutcome::Proceed(returned) => {
                        // Contention resolved in the opener's favor (or
                        // vanished between the check and the park); run
                        // the request again without re-deferring.
                        packet = returned;
                        oplock_checked = true;
                        continue;
                    }
                    BreakOutcome::Denied(returned) => {
                        return Outcome::Reply(error_response(&returned, SmbStatus::NTAccessDenied))
                    }
                    BreakOutcome::Deferred => return Outcome::Deferred,
                }
            }
            Err(status) => return Outcome::Reply(error_response(&packet, status)),
        }
    }
}

/// Builds an error-only response: empty block, status set.
pub fn error_response(req: &SmbPacket, status: SmbStatus) -> SmbPacket {
    let mut resp = SmbPacket::response_to(req);
    resp.begin_block(0);
    resp.finish_block();
    resp.set_status(status);
    resp
}

/// Commands whose parameter block leads with an AndX slot.
fn is_andx(cmd: Command) -> bool {
    matches!(
        cmd,
        Command::SessionSetupAndX
            | Command::LogoffAndX
            | Command::TreeConnectAndX
            | Command::OpenAndX
            | Command::NTCreateAndX
            | Command::ReadAndX
            | Command::WriteAndX
            | Command::LockingAndX
    )
}

async fn dispatch_chain(
    session: &mut SmbSession,
    cmd: Command,
    req: &mut SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    match dispatch_one(session, cmd, req, resp, chain).await? {
        Control::Reply => {}
        other => return Ok(other),
    }
    if !is_andx(cmd) {
        return Ok(Control::Reply);
    }

    let mut prev_cmd = cmd;
    let mut prev_block = resp.block_offset();
    // A chained close ends the chain no matter what follows it.
    while prev_cmd != Command::CloseFile && req.has_andx_command() {
        let next_byte = req.andx_command();
        let next_offset = req.andx_offset();
        let Some(next_cmd) = Command::from_u8(next_byte) else {
            resp.set_status(SmbStatus::SrvNotSupported);
            break;
        };
        if req.seek_block(next_offset).is_err() {
            resp.set_status(SmbStatus::SrvUnrecognizedCommand);
            break;
        }
        debug!(command = ?next_cmd, "chained command");
        match dispatch_one(session, next_cmd, req, resp, chain).await {
            Ok(Control::Reply) => {
                let block = resp.block_offset();
                resp.set_block_param_u16(prev_block, 0, next_byte as u16);
                resp.set_block_param_u16(prev_block, 1, block as u16);
                prev_block = block;
                prev_cmd = next_cmd;
            }
            // Deferral abandons the partial response; the replay runs the
            // whole chain again.
            Ok(other) => return Ok(other),
            Err(status) => {
                // The failing link's slot stays unset; earlier blocks are
                // preserved and the chain stops with the error status.
                resp.set_status(status);
                break;
            }
        }
    }
    Ok(Control::Reply)
}

async fn dispatch_one(
    session: &mut SmbSession,
    cmd: Command,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let (shape, min_bytes, requires) = command_table(cmd);
    let shape_ok = match shape {
        Shape::Exact(words) => req.check_shape(words, min_bytes),
        Shape::Min(words) => req.check_shape_min(words, min_bytes),
    };
    if !shape_ok {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }

    let uid = chain.uid.unwrap_or_else(|| req.uid());
    let tid = chain.tid.unwrap_or_else(|| req.tid());

    if requires != Requires::Nothing {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        if requires != Requires::Circuit {
            let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
            match requires {
                Requires::ReadAccess if !tree.has_read_permission() => {
                    return Err(SmbStatus::DosAccessDenied)
                }
                Requires::WriteAccess if !tree.has_write_permission() => {
                    return Err(SmbStatus::DosAccessDenied)
                }
                _ => {}
            }
        }
    }

    use Command::*;
    match cmd {
        Negotiate => session_setup::negotiate(session, req, resp).await,
        SessionSetupAndX => session_setup::session_setup(session, req, resp, chain).await,
        LogoffAndX => session_setup::logoff(session, uid, resp).await,
        TreeConnect => tree::tree_connect(session, uid, req, resp, false, chain).await,
        TreeConnectAndX => tree::tree_connect(session, uid, req, resp, true, chain).await,
        TreeDisconnect => tree::tree_disconnect(session, uid, tid, resp).await,
        Echo => misc::echo(session, req, resp).await,
        ProcessExit => misc::process_exit(session, uid, req, resp).await,
        NTCancel => misc::nt_cancel(session, uid, tid, req).await,
        CreateDirectory => path_ops::create_directory(session, uid, tid, req, resp).await,
        DeleteDirectory => path_ops::delete_directory(session, uid, tid, req, resp).await,
        CheckDirectory => path_ops::check_directory(session, uid, tid, req, resp).await,
        DeleteFile => path_ops::delete_file(session, uid, tid, req, resp).await,
        RenameFile => path_ops::rename_file(session, uid, tid, req, resp).await,
        OpenFile => open::open_legacy(session, uid, tid, req, resp).await,
        CreateFile => open::create_legacy(session, uid, tid, req, resp).await,
        OpenAndX => open::open_andx(session, uid, tid, req, resp, chain).await,
        NTCreateAndX => open::nt_create(session, uid, tid, req, resp, chain).await,
        CloseFile => open::close(session, uid, tid, req, resp, chain).await,
        FlushFile => io::flush(session, uid, tid, req, resp).await,
        ReadFile => io::read_legacy(session, uid, tid, req, resp).await,
        WriteFile => io::write_legacy(session, uid, tid, req, resp).await,
        WriteAndClose => io::write_and_close(session, uid, tid, req, resp).await,
        ReadAndX => io::read_andx(session, uid, tid, req, resp, chain).await,
        WriteAndX => io::write_andx(session, uid, tid, req, resp, chain).await,
        SeekFile => io::seek(session, uid, tid, req, resp).await,
        LockFile => locking::lock_legacy(session, uid, tid, req, resp, true).await,
        UnLockFile => locking::lock_legacy(session, uid, tid, req, resp, false).await,
        LockingAndX => locking::locking_andx(session, uid, tid, req, resp, chain).await,
        GetFileAttributes => attr::query_information(session, uid, tid, req, resp).await,
        SetFileAttributes => attr::set_information(session, uid, tid, req, resp).await,
        QueryInformation2 => attr::query_information2(session, uid, tid, req, resp).await,
        SetInformation2 => attr::set_information2(session, uid, tid, req, resp).await,
        DiskInformation => attr::disk_information(session, uid, tid, resp).await,
        Search => search::search_legacy(session, uid, tid, req, resp).await,
        FindClose2 => search::find_close2(session, uid, req, resp).await,
        Transaction => transact::trans_primary(session, uid, tid, req, resp).await,
        TransactionSecond => transact::trans2_secondary(session, uid, tid, req, resp).await,
        Transaction2 => transact::trans2_primary(session, uid, tid, req, resp).await,
        Transaction2Second => transact::trans2_secondary(session, uid, tid, req, resp).await,
        NTTransact => transact::nt_primary(session, uid, tid, req, resp).await,
        NTTransactSecond => transact::nt_secondary(session, uid, tid, req, resp).await,
        Find | FindUnique | IOCtl | LockAndRead | WriteAndUnlock | ReadRaw | WriteRaw => {
            Err(SmbStatus::SrvNotSupported)
        }
    }
}

// --- helpers shared with the transaction sub-handlers ---

/// The shared device a tree is bound to.
pub(crate) fn share_of(
    session: &SmbSession,
    uid: u16,
    tid: u16,
) -> Result<Arc<SharedDevice>, SmbStatus> {
    let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
    Ok(Arc::clone(&tree.share))
}

/// The filesystem driver behind a tree; pipe trees have none.
pub(crate) fn disk_of(
    session: &SmbSession,
    uid: u16,
    tid: u16,
) -> Result<Arc<dyn DiskInterface>, SmbStatus> {
    share_of(session, uid, tid)?.disk().cloned().ok_or(SmbStatus::NTAccessDenied)
}

pub(crate) fn find_open_file<'a>(
    session: &'a SmbSession,
    uid: u16,
    tid: u16,
    fid: u16,
) -> Result<&'a OpenFile, SmbStatus> {
    let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
    tree.find_file(fid).ok_or(SmbStatus::DosInvalidHandle)
}

pub(crate) fn find_open_file_mut<'a>(
    session: &'a mut SmbSession,
    uid: u16,
    tid: u16,
    fid: u16,
) -> Result<&'a mut OpenFile, SmbStatus> {
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree_mut(tid).ok_or(SmbStatus::DosInvalidDrive)?;
    tree.find_file_mut(fid).ok_or(SmbStatus::DosInvalidHandle)
}

/// Reads a possibly-Unicode string out of the current block's byte area.
/// `offset` is relative to the start of the byte block; returns the
/// string and the offset just past its terminator. Unicode strings align
/// to even offsets from the header.
pub(crate) fn read_smb_string(
    req: &SmbPacket,
    offset: usize,
) -> Result<(String, usize), SmbStatus> {
    let raw = req.as_slice();
    let mut abs = req.bytes_offset() + offset;
    let end = req.bytes_offset() + req.byte_count() as usize;
    if req.is_unicode() {
        abs += abs & 1;
        let mut units = Vec::new();
        loop {
            if abs + 2 > end || abs + 2 > raw.len() {
                return Err(SmbStatus::SrvUnrecognizedCommand);
            }
            let unit = crate::pack::get_u16(raw, abs);
            abs += 2;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        let s = String::from_utf16(&units).map_err(|_| SmbStatus::NTInvalidParameter)?;
        Ok((s, abs - req.bytes_offset()))
    } else {
        let mut out = Vec::new();
        loop {
            if abs >= end || abs >= raw.len() {
                return Err(SmbStatus::SrvUnrecognizedCommand);
            }
            let b = raw[abs];
            abs += 1;
            if b == 0 {
                break;
            }
            out.push(b);
        }
        let s = String::from_utf8(out).map_err(|_| SmbStatus::NTInvalidParameter)?;
        Ok((s, abs - req.bytes_offset()))
    }
}

/// Reads a legacy path: the `0x04` ASCII buffer-format marker followed by
/// the string, normalized to a leading backslash.
pub(crate) fn read_legacy_path(
    req: &SmbPacket,
    offset: usize,
) -> Result<(String, usize), SmbStatus> {
    let bytes = req.bytes();
    let skip = if bytes.get(offset) == Some(&0x04) { 1 } else { 0 };
    let (path, next) = read_smb_string(req, offset + skip)?;
    Ok((normalize_path(&path), next))
}

/// Canonicalizes a share-relative path: backslash separators, leading
/// backslash, no trailing separator (except the root itself).
pub(crate) fn normalize_path(path: &str) -> String {
    let mut out: String = path.replace('/', "\\");
    if !out.starts_with('\\') {
        out.insert(0, '\\');
    }
    while out.len() > 1 && out.ends_with('\\') {
        out.pop();
    }
    out
}
