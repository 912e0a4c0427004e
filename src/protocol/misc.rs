//! ECHO, PROCESS_EXIT and NT_CANCEL.

use tracing::debug;

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{open, share_of, Control};
use crate::session::SmbSession;
use crate::status::SmbStatus;

/// ECHO: replies `count` times with the request's payload and an
/// incrementing sequence number. A zero count gets no reply at all.
pub async fn echo(
    session: &mut SmbSession,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let count = req.param_u16(0);
    if count == 0 {
        return Ok(Control::NoReply);
    }

    // All but the last reply go straight to the writer; the dispatcher
    // sends the final one, keeping the channel ordered.
    for sequence in 1..count {
        let mut extra = SmbPacket::response_to(req);
        extra.begin_block(1);
        extra.set_param_u16(0, sequence);
        pack::put_bytes(extra.data(), req.bytes());
        extra.finish_block();
        session.writer.send_packet(extra);
    }

    resp.begin_block(1);
    resp.set_param_u16(0, count);
    pack::put_bytes(resp.data(), req.bytes());
    resp.finish_block();
    Ok(Control::Reply)
}

/// PROCESS_EXIT: closes every handle the client process left open on
/// this circuit.
pub async fn process_exit(
    session: &mut SmbSession,
    uid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let pid = req.pid();
    let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let mut doomed = Vec::new();
    for tid in vc.tree_ids() {
        if let Some(tree) = vc.find_tree(tid) {
            for fid in tree.fids() {
                if tree.find_file(fid).is_some_and(|f| f.pid == pid) {
                    doomed.push((tid, fid));
                }
            }
        }
    }
    debug!(pid, handles = doomed.len(), "process exit");
    for (tid, fid) in doomed {
        let _ = open::close_fid(session, uid, tid, fid).await;
    }

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// NT_CANCEL: cancels the pending change-notify matching the request's
/// correlation tuple. The cancelled reply (when one is due) comes from
/// the notification registry; the cancel itself never gets a response.
pub async fn nt_cancel(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
) -> Result<Control, SmbStatus> {
    let share = share_of(session, uid, tid)?;
    let found = share.notify.cancel(req.mid(), req.tid(), req.uid(), req.pid());
    debug!(mid = req.mid(), found, "nt cancel");
    Ok(Control::NoReply)
}
